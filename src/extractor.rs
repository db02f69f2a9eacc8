use crate::error::EngineError;
use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const EXTRACTOR_TIMEOUT: Duration = Duration::from_secs(1);
const EXTRACTOR_RETRIES: u32 = 1;

/// A symbol candidate returned by the extractor collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedSymbol {
    pub symbol: String,
    pub confidence: f64,
}

/// Collaborator that resolves a single best ticker symbol from article text
/// when the provider's hint field is missing or ambiguous.
#[async_trait]
pub trait TickerExtractor: Send + Sync {
    async fn extract(
        &self,
        text: &str,
        hint: &[String],
    ) -> Result<Option<ExtractedSymbol>, EngineError>;
}

#[derive(Serialize)]
struct ExtractRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'a [String]>,
}

#[derive(Deserialize)]
struct ExtractResponse {
    symbol: Option<String>,
    confidence: f64,
}

/// HTTP implementation of the extractor contract: `POST /extract` with
/// `{text, hint?}`, response `{symbol, confidence}`. One retry, 1 s timeout.
pub struct HttpTickerExtractor {
    client: reqwest::Client,
    url: String,
}

impl HttpTickerExtractor {
    pub fn new(url: &str) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(EXTRACTOR_TIMEOUT)
            .build()
            .map_err(|err| EngineError::Config(format!("extractor client: {}", err)))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    async fn call(&self, request: &ExtractRequest<'_>) -> Result<ExtractResponse, EngineError> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|err| EngineError::Extractor(err.to_string()))?;
        if !response.status().is_success() {
            return Err(EngineError::Extractor(format!(
                "extractor returned {}",
                response.status()
            )));
        }
        response
            .json::<ExtractResponse>()
            .await
            .map_err(|err| EngineError::Extractor(err.to_string()))
    }
}

#[async_trait]
impl TickerExtractor for HttpTickerExtractor {
    async fn extract(
        &self,
        text: &str,
        hint: &[String],
    ) -> Result<Option<ExtractedSymbol>, EngineError> {
        let request = ExtractRequest {
            text,
            hint: if hint.is_empty() { None } else { Some(hint) },
        };
        let mut last_err = None;
        for attempt in 0..=EXTRACTOR_RETRIES {
            match self.call(&request).await {
                Ok(response) => {
                    return Ok(response.symbol.map(|symbol| ExtractedSymbol {
                        symbol,
                        confidence: response.confidence,
                    }));
                }
                Err(err) => {
                    if attempt < EXTRACTOR_RETRIES {
                        warn!("extractor attempt {} failed: {}", attempt + 1, err);
                    }
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| EngineError::Extractor("no attempts made".to_string())))
    }
}
