//! Semantic retrieval over foreshadowing (plot arcs).
//!
//! Embeddings are cached directly on `PlotArc.embedding` as a JSON float
//! array; similarity is a pure cosine computation, no vector database
//! involved. When no embedding API key is configured (or a call to it
//! fails), retrieval falls back to an offline hash-shingle embedding, and
//! if even that produces nothing useful, to a keyword hit-count ranker.

use async_trait::async_trait;
use narrative_storage::{Database, PlotArc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;

const OFFLINE_EMBEDDING_DIM: usize = 512;

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Offline fallback embedding: hashes character bigrams (plus single
/// characters for very short text) into a fixed-size bucket vector, then
/// L2-normalizes it. No external dependency, works directly on the
/// Chinese-heavy prose this engine targets.
pub fn offline_embed(text: &str) -> Vec<f32> {
    let chars: Vec<char> = text.chars().collect();
    let shingles: Vec<String> = if chars.len() >= 2 {
        chars.windows(2).map(|w| w.iter().collect()).collect()
    } else {
        chars.iter().map(|c| c.to_string()).collect()
    };

    let mut vec = vec![0.0f32; OFFLINE_EMBEDDING_DIM];
    for shingle in &shingles {
        let idx = (fnv1a(shingle.as_bytes()) as usize) % OFFLINE_EMBEDDING_DIM;
        vec[idx] += 1.0;
    }

    let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vec.iter_mut() {
            *x /= norm;
        }
    }
    vec
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// An embedding backend, selected by priority: an OpenAI-compatible
/// embeddings endpoint when an API key is configured, otherwise the offline
/// hash-shingle backend below.
#[async_trait]
trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

struct OfflineBackend;

#[async_trait]
impl EmbeddingBackend for OfflineBackend {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(offline_embed(text))
    }
}

struct OpenAiEmbeddingBackend {
    http: Client,
    api_key: String,
    base_url: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingBackend for OpenAiEmbeddingBackend {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: "text-embedding-3-small",
            input: text,
        };
        let response = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        let body: EmbeddingResponse = response.json().await?;
        let embedding = body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| crate::error::EngineError::ProviderOther("embeddings response had no data".into()))?;
        Ok(embedding)
    }
}

fn build_backend(api_key: Option<&str>, base_url: Option<&str>) -> Box<dyn EmbeddingBackend> {
    if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
        info!("RAG retriever using OpenAI-compatible embedding backend");
        return Box::new(OpenAiEmbeddingBackend {
            http: Client::new(),
            api_key: key.to_string(),
            base_url: base_url.unwrap_or("https://api.openai.com/v1").to_string(),
        });
    }
    info!("RAG retriever using offline hash-shingle embedding backend");
    Box::new(OfflineBackend)
}

#[derive(Debug, Clone, Serialize)]
pub struct ArcCard {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub status: String,
    pub importance: String,
    pub planted_chapter: Option<i64>,
    pub resolved_chapter: Option<i64>,
    pub related_characters: Vec<String>,
    pub related_keywords: Vec<String>,
    pub similarity: f32,
}

fn arc_to_card(arc: &PlotArc, similarity: f32) -> ArcCard {
    ArcCard {
        id: arc.id,
        name: arc.name.clone(),
        description: arc.description.clone(),
        status: arc.status.clone(),
        importance: arc.importance.clone(),
        planted_chapter: arc.planted_chapter,
        resolved_chapter: arc.resolved_chapter,
        related_characters: serde_json::from_str(&arc.related_characters).unwrap_or_default(),
        related_keywords: serde_json::from_str(&arc.related_keywords).unwrap_or_default(),
        similarity,
    }
}

fn arc_to_text(arc: &PlotArc) -> String {
    let mut parts = vec![arc.name.clone(), arc.description.clone()];
    let related_characters: Vec<String> = serde_json::from_str(&arc.related_characters).unwrap_or_default();
    if !related_characters.is_empty() {
        parts.push(format!("related characters: {}", related_characters.join(", ")));
    }
    let related_keywords: Vec<String> = serde_json::from_str(&arc.related_keywords).unwrap_or_default();
    if !related_keywords.is_empty() {
        parts.push(format!("keywords: {}", related_keywords.join(", ")));
    }
    parts.join(" ")
}

/// Semantic retriever over a project's plot arcs. Embedding generation
/// prefers an OpenAI-compatible embeddings endpoint when a provider client
/// is supplied; otherwise it runs entirely offline.
pub struct RagRetriever {
    db: Database,
    backend: Box<dyn EmbeddingBackend>,
}

impl RagRetriever {
    pub fn new(db: Database, api_key: Option<&str>, base_url: Option<&str>) -> Self {
        Self {
            db,
            backend: build_backend(api_key, base_url),
        }
    }

    async fn embed(&self, text: &str) -> Vec<f32> {
        match self.backend.embed(text).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "embedding backend call failed, falling back to offline hash embedding");
                offline_embed(text)
            }
        }
    }

    /// Lazily generates and caches embeddings for arcs that don't have one
    /// yet (or, with `force`, regenerates every embedding).
    pub async fn index(&self, project_id: i64, force: bool) -> Result<usize> {
        let repo = narrative_storage::repository::PlotArcRepository::new(&self.db.pool);
        let arcs = if force {
            repo.list_for_project(project_id).await?
        } else {
            repo.get_without_embedding(project_id).await?
        };

        let mut count = 0;
        for arc in &arcs {
            let text = arc_to_text(arc);
            let embedding = self.embed(&text).await;
            let json = serde_json::to_string(&embedding)?;
            if let Err(e) = repo.set_embedding(arc.id, &json).await {
                warn!(arc_id = arc.id, error = %e, "failed to persist plot arc embedding");
                continue;
            }
            count += 1;
        }
        Ok(count)
    }

    pub async fn retrieve(
        &self,
        project_id: i64,
        query: &str,
        top_k: usize,
        only_active: bool,
        min_similarity: f32,
    ) -> Result<Vec<ArcCard>> {
        let repo = narrative_storage::repository::PlotArcRepository::new(&self.db.pool);
        let arcs = if only_active {
            repo.get_active(project_id).await?
        } else {
            repo.list_for_project(project_id).await?
        };

        if arcs.is_empty() {
            return Ok(Vec::new());
        }

        let query_vec = self.embed(query).await;

        let mut scored: Vec<(f32, &PlotArc)> = Vec::new();
        for arc in &arcs {
            let embedding: Option<Vec<f32>> = arc.embedding.as_ref().and_then(|e| serde_json::from_str(e).ok());
            let embedding = match embedding {
                Some(e) => e,
                None => {
                    let text = arc_to_text(arc);
                    let e = self.embed(&text).await;
                    let json = serde_json::to_string(&e)?;
                    if let Err(err) = repo.set_embedding(arc.id, &json).await {
                        warn!(arc_id = arc.id, error = %err, "failed to lazily persist plot arc embedding");
                    }
                    e
                }
            };
            let sim = cosine_similarity(&query_vec, &embedding);
            if sim >= min_similarity {
                scored.push((sim, arc));
            }
        }

        if scored.is_empty() {
            return Ok(keyword_fallback(&arcs, query, top_k));
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(top_k).map(|(sim, arc)| arc_to_card(arc, sim)).collect())
    }
}

/// Active arcs ranked by importance (high first, ties broken by id), for
/// callers with no scan text to retrieve against.
pub async fn top_active_by_importance(db: &Database, project_id: i64, top_k: usize) -> Result<Vec<ArcCard>> {
    let repo = narrative_storage::repository::PlotArcRepository::new(&db.pool);
    let mut arcs = repo.get_active(project_id).await?;
    arcs.sort_by(|a, b| a.importance().rank().cmp(&b.importance().rank()).then(a.id.cmp(&b.id)));
    Ok(arcs.iter().take(top_k).map(|arc| arc_to_card(arc, 0.0)).collect())
}

fn keyword_fallback(arcs: &[PlotArc], query: &str, top_k: usize) -> Vec<ArcCard> {
    let normalized = query.to_lowercase();
    let mut scored: Vec<(usize, &PlotArc)> = Vec::new();
    for arc in arcs {
        let mut keywords: Vec<String> = serde_json::from_str(&arc.related_keywords).unwrap_or_default();
        keywords.push(arc.name.clone());
        let hits = keywords.iter().filter(|kw| normalized.contains(&kw.to_lowercase())).count();
        if hits > 0 {
            scored.push((hits, arc));
        }
    }
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored
        .into_iter()
        .take(top_k)
        .map(|(hits, arc)| {
            let keyword_count = {
                let k: Vec<String> = serde_json::from_str(&arc.related_keywords).unwrap_or_default();
                k.len().max(1)
            };
            arc_to_card(arc, hits as f32 / keyword_count as f32)
        })
        .collect()
}
