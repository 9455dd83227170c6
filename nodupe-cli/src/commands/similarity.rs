use std::collections::HashMap;
use std::path::PathBuf;

use nodupe_core::similarity::{BruteForceIndex, SimilarityBackend};
use nodupe_core::{Catalog, CoreContext, EmbeddingId, Error};

use crate::output::OutputFormat;

#[derive(clap::Args)]
pub struct SimilarityArgs {
    /// Find files similar to this one
    #[arg(long, value_name = "PATH", conflicts_with = "cluster")]
    query: Option<PathBuf>,

    /// Group all embedded files into similarity clusters
    #[arg(long)]
    cluster: bool,

    /// Neighbors to return
    #[arg(long, default_value_t = 10)]
    k: usize,

    /// Minimum cosine similarity
    #[arg(long, default_value_t = 0.9)]
    threshold: f32,
}

pub fn handle_similarity(
    context: &CoreContext,
    args: SimilarityArgs,
    format: OutputFormat,
) -> anyhow::Result<u8> {
    if args.query.is_none() && !args.cluster {
        return Err(Error::InvalidInput(
            "similarity requires --query <path> or --cluster".into(),
        )
        .into());
    }

    let catalog = super::open_catalog(context)?;
    let embeddings = catalog.list_embeddings()?;
    if embeddings.is_empty() {
        return Err(Error::InvalidInput(
            "no embeddings in the catalog; run scan --embed first".into(),
        )
        .into());
    }

    let dim = embeddings[0].1.len() as u16;
    let mut index = BruteForceIndex::new(dim);
    for (id, vector) in &embeddings {
        index.add(*id, vector)?;
    }

    let paths_by_embedding = embedding_paths(&catalog)?;

    if let Some(query_path) = &args.query {
        let mime = mime_guess::from_path(query_path)
            .first_raw()
            .unwrap_or("application/octet-stream");
        let model = context
            .registry()
            .model_for_mime(mime)
            .ok_or_else(|| Error::InvalidInput(format!("no embedding model for mime {mime}")))?;
        let mut file = std::fs::File::open(query_path)
            .map_err(|e| Error::from_io(e, query_path))?;
        let vector = model.embed(&mut file, context.cancel_token())?;

        let neighbors = index.query(&vector, args.k, args.threshold)?;
        let results: Vec<QueryHit> = neighbors
            .iter()
            .flat_map(|(embedding_id, score)| {
                paths_by_embedding
                    .get(embedding_id)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|path| QueryHit {
                        path,
                        score: *score,
                    })
            })
            .collect();

        format.print(&results, || {
            if results.is_empty() {
                "no matches above the threshold".to_string()
            } else {
                results
                    .iter()
                    .map(|hit| format!("{:.4}  {}", hit.score, hit.path.display()))
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        })?;
        return Ok(0);
    }

    let clusters: Vec<Vec<PathBuf>> = index
        .clusters(args.threshold)
        .into_iter()
        .filter(|members| members.len() >= 2)
        .map(|members| {
            members
                .iter()
                .flat_map(|id| paths_by_embedding.get(id).cloned().unwrap_or_default())
                .collect()
        })
        .collect();

    format.print(&clusters, || {
        if clusters.is_empty() {
            "no similarity clusters at this threshold".to_string()
        } else {
            clusters
                .iter()
                .enumerate()
                .map(|(i, members)| {
                    let mut lines = vec![format!("cluster {}:", i)];
                    lines.extend(members.iter().map(|p| format!("  {}", p.display())));
                    lines.join("\n")
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
    })?;
    Ok(0)
}

#[derive(serde::Serialize)]
struct QueryHit {
    path: PathBuf,
    score: f32,
}

/// Map embedding ids to the absolute paths of files referencing them.
fn embedding_paths(
    catalog: &impl Catalog,
) -> anyhow::Result<HashMap<EmbeddingId, Vec<PathBuf>>> {
    let roots: HashMap<_, _> = catalog.list_roots()?.into_iter().collect();
    let mut map: HashMap<EmbeddingId, Vec<PathBuf>> = HashMap::new();
    for record in catalog.list_files(None)? {
        let Some(embedding_id) = record.embedding_id else {
            continue;
        };
        if let Some(root) = roots.get(&record.root_id) {
            map.entry(embedding_id)
                .or_default()
                .push(root.join(&record.relative_path));
        }
    }
    Ok(map)
}
