use crate::broker::NewsArticle;
use crate::extractor::TickerExtractor;
use crate::model::TickerEvent;
use crate::shutdown::Shutdown;
use crate::stages::DRAIN_DEADLINE;
use crate::types::Symbol;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Suppression window for repeated `(symbol, articleId)` pairs.
const DEDUP_WINDOW: Duration = Duration::from_secs(60);

/// Latency budget per article, excluding extractor I/O.
const LATENCY_BUDGET: Duration = Duration::from_millis(50);

/// Turns raw news articles into at most one `TickerEvent` each. Tries the
/// provider's symbol hint first; falls back to the extractor collaborator on
/// a miss or ambiguity.
pub struct NewsStage {
    extractor: Arc<dyn TickerExtractor>,
    recent: HashMap<(Symbol, String), Instant>,
}

impl NewsStage {
    pub fn new(extractor: Arc<dyn TickerExtractor>) -> Self {
        Self {
            extractor,
            recent: HashMap::new(),
        }
    }

    pub async fn run(
        mut self,
        mut raw_news: mpsc::Receiver<NewsArticle>,
        tickers: mpsc::Sender<TickerEvent>,
        mut shutdown: Shutdown,
    ) {
        info!("news stage started");
        loop {
            tokio::select! {
                article = raw_news.recv() => {
                    let Some(article) = article else { break };
                    self.handle(article, &tickers).await;
                }
                _ = shutdown.cancelled() => {
                    let deadline = Instant::now() + DRAIN_DEADLINE;
                    while Instant::now() < deadline {
                        match raw_news.try_recv() {
                            Ok(article) => self.handle(article, &tickers).await,
                            Err(_) => break,
                        }
                    }
                    break;
                }
            }
        }
        info!("news stage stopped");
    }

    async fn handle(&mut self, article: NewsArticle, tickers: &mpsc::Sender<TickerEvent>) {
        let started = Instant::now();
        let mut extractor_time = Duration::ZERO;

        let symbol = match self.symbol_from_hint(&article) {
            Some(symbol) => Some(symbol),
            None => {
                let call_started = Instant::now();
                let resolved = self.symbol_from_extractor(&article).await;
                extractor_time = call_started.elapsed();
                resolved
            }
        };

        let Some(symbol) = symbol else {
            debug!("article {}: no tradable symbol identified", article.article_id);
            return;
        };

        if self.is_duplicate(&symbol, &article.article_id) {
            debug!(
                "article {}: suppressing duplicate for {}",
                article.article_id, symbol
            );
            return;
        }

        let event = TickerEvent {
            symbol: symbol.clone(),
            article_id: article.article_id.clone(),
            published_at: article.published_at,
            received_at: article.received_at,
        };
        info!("article {} -> ticker {}", article.article_id, symbol);
        if tickers.send(event).await.is_err() {
            warn!("ticker queue closed, dropping event");
            return;
        }

        let own_time = started.elapsed().saturating_sub(extractor_time);
        if own_time > LATENCY_BUDGET {
            warn!(
                "article {}: news stage took {:?} (budget {:?})",
                article.article_id, own_time, LATENCY_BUDGET
            );
        }
    }

    /// Cheap path: accept the hint only when it nominates exactly one valid
    /// symbol. Zero or several distinct candidates defer to the extractor.
    fn symbol_from_hint(&self, article: &NewsArticle) -> Option<Symbol> {
        let mut candidates: Vec<Symbol> = article
            .symbols_hint
            .iter()
            .filter_map(|raw| Symbol::parse(raw.trim()).ok())
            .collect();
        candidates.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        candidates.dedup();
        if candidates.len() == 1 {
            candidates.pop()
        } else {
            None
        }
    }

    async fn symbol_from_extractor(&self, article: &NewsArticle) -> Option<Symbol> {
        let text = if article.body.is_empty() {
            &article.headline
        } else {
            &article.body
        };
        match self.extractor.extract(text, &article.symbols_hint).await {
            Ok(Some(extracted)) => match Symbol::parse(extracted.symbol.trim()) {
                Ok(symbol) => {
                    debug!(
                        "article {}: extractor resolved {} (confidence {:.2})",
                        article.article_id, symbol, extracted.confidence
                    );
                    Some(symbol)
                }
                Err(invalid) => {
                    warn!(
                        "article {}: extractor returned {}, rejected",
                        article.article_id, invalid
                    );
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!("article {}: extractor failed: {}", article.article_id, err);
                None
            }
        }
    }

    fn is_duplicate(&mut self, symbol: &Symbol, article_id: &str) -> bool {
        let now = Instant::now();
        self.recent
            .retain(|_, seen| now.duration_since(*seen) < DEDUP_WINDOW);
        let key = (symbol.clone(), article_id.to_string());
        if self.recent.contains_key(&key) {
            return true;
        }
        self.recent.insert(key, now);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::extractor::ExtractedSymbol;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    /// Scripted extractor: returns a fixed answer and counts calls.
    struct StubExtractor {
        answer: Option<String>,
        calls: Mutex<u32>,
    }

    impl StubExtractor {
        fn new(answer: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                answer: answer.map(|s| s.to_string()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl TickerExtractor for StubExtractor {
        async fn extract(
            &self,
            _text: &str,
            _hint: &[String],
        ) -> Result<Option<ExtractedSymbol>, EngineError> {
            *self.calls.lock().unwrap() += 1;
            Ok(self.answer.clone().map(|symbol| ExtractedSymbol {
                symbol,
                confidence: 0.9,
            }))
        }
    }

    fn article(id: &str, hints: &[&str]) -> NewsArticle {
        NewsArticle {
            article_id: id.to_string(),
            provider: "BZ".to_string(),
            headline: "Acme surges on earnings".to_string(),
            body: "Acme surges on earnings".to_string(),
            symbols_hint: hints.iter().map(|s| s.to_string()).collect(),
            published_at: Utc::now(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_single_hint_skips_extractor() {
        let extractor = StubExtractor::new(Some("WRONG"));
        let mut stage = NewsStage::new(extractor.clone());
        let (tx, mut rx) = mpsc::channel(8);

        stage.handle(article("a-1", &["KITT"]), &tx).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.symbol.as_str(), "KITT");
        assert_eq!(event.article_id, "a-1");
        assert_eq!(extractor.calls(), 0);
    }

    #[tokio::test]
    async fn test_ambiguous_hint_defers_to_extractor() {
        let extractor = StubExtractor::new(Some("AAPL"));
        let mut stage = NewsStage::new(extractor.clone());
        let (tx, mut rx) = mpsc::channel(8);

        stage.handle(article("a-2", &["AAPL", "MSFT"]), &tx).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.symbol.as_str(), "AAPL");
        assert_eq!(extractor.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_hint_and_extractor_miss_emits_nothing() {
        let extractor = StubExtractor::new(None);
        let mut stage = NewsStage::new(extractor.clone());
        let (tx, mut rx) = mpsc::channel(8);

        stage.handle(article("a-3", &["not-a-ticker"]), &tx).await;

        assert_eq!(extractor.calls(), 1);
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_extractor_answer_is_rejected() {
        let extractor = StubExtractor::new(Some("bad symbol"));
        let mut stage = NewsStage::new(extractor);
        let (tx, mut rx) = mpsc::channel(8);

        stage.handle(article("a-4", &[]), &tx).await;

        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_article_suppressed() {
        let extractor = StubExtractor::new(None);
        let mut stage = NewsStage::new(extractor);
        let (tx, mut rx) = mpsc::channel(8);

        stage.handle(article("a-5", &["KITT"]), &tx).await;
        stage.handle(article("a-5", &["KITT"]), &tx).await;

        assert!(rx.recv().await.is_some());
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_hints_count_as_one_candidate() {
        let extractor = StubExtractor::new(None);
        let mut stage = NewsStage::new(extractor.clone());
        let (tx, mut rx) = mpsc::channel(8);

        stage.handle(article("a-6", &["KITT", "KITT"]), &tx).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.symbol.as_str(), "KITT");
        assert_eq!(extractor.calls(), 0);
    }
}
