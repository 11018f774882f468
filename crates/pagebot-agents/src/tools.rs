//! Product search collaborator and the single bounded tool-call round-trip.

use std::future::Future;

use async_trait::async_trait;
use pagebot_common::{Product, Result, TokenUsage};
use tracing::{debug, warn};

use crate::parser::{ModelOutput, StructuredReply, parse_model_output};
use crate::prompt::{format_price, format_product_listing};
use crate::providers::{ChatMessage, LlmResponse};

/// Read-only access to a page owner's product catalog.
#[async_trait]
pub trait ProductSearch: Send + Sync {
    async fn search(&self, owner_id: &str, query: &str, page_id: &str) -> Result<Vec<Product>>;
}

/// Catalog with no products, for deployments without product search.
pub struct NoProductSearch;

#[async_trait]
impl ProductSearch for NoProductSearch {
    async fn search(&self, _owner_id: &str, _query: &str, _page_id: &str) -> Result<Vec<Product>> {
        Ok(Vec::new())
    }
}

const NO_MATCH_REPLY: &str =
    "Sorry, I couldn't find a matching product right now. Could you describe it differently?";

/// Result of the tool round-trip.
#[derive(Debug)]
pub struct ToolRound {
    pub output: ModelOutput,
    /// Usage of the tool-call response plus the follow-up call, if one was made.
    pub usage: TokenUsage,
    /// Listing text shown to the model, used to ground reply images.
    pub listing: String,
    pub reinvoked: bool,
}

pub struct ToolLoop<'a> {
    pub search: &'a dyn ProductSearch,
    pub owner_id: &'a str,
    pub page_id: &'a str,
    /// Build the reply straight from search rows when there are any.
    pub direct_synthesis: bool,
}

impl ToolLoop<'_> {
    /// Serve one search request and re-invoke the model at most once.
    ///
    /// `first` is the response that carried the tool call and `messages` the
    /// sequence that produced it. A tool call in the second response is not
    /// honored.
    pub async fn run<F, Fut>(
        &self,
        query: &str,
        first: &LlmResponse,
        messages: &[ChatMessage],
        reinvoke: F,
    ) -> Result<ToolRound>
    where
        F: FnOnce(Vec<ChatMessage>) -> Fut,
        Fut: Future<Output = Result<LlmResponse>>,
    {
        let products = match self.search.search(self.owner_id, query, self.page_id).await {
            Ok(products) => products,
            Err(e) => {
                warn!(page_id = self.page_id, "product search failed: {e}");
                Vec::new()
            }
        };
        debug!(query, results = products.len(), "served product search");
        let listing = format_product_listing(&products);

        if self.direct_synthesis && !products.is_empty() {
            return Ok(ToolRound {
                output: ModelOutput::Reply(synthesize_reply(&products)),
                usage: first.usage,
                listing,
                reinvoked: false,
            });
        }

        let mut follow_up = messages.to_vec();
        follow_up.push(ChatMessage::assistant(first.content.clone()));
        follow_up.push(ChatMessage::user(search_results_turn(query, &listing)));

        let second = reinvoke(follow_up).await?;
        let output = match parse_model_output(&second.content) {
            ModelOutput::ToolCall(call) => {
                debug!(tool = %call.name, "ignoring repeated tool call");
                ModelOutput::Reply(synthesize_reply(&products))
            }
            other => other,
        };

        Ok(ToolRound {
            output,
            usage: first.usage + second.usage,
            listing,
            reinvoked: true,
        })
    }
}

fn search_results_turn(query: &str, listing: &str) -> String {
    if listing.is_empty() {
        format!(
            "Search results for \"{query}\": no matching products. Answer the customer now \
             using the required JSON format, without calling a tool."
        )
    } else {
        format!(
            "Search results for \"{query}\":\n{listing}\n\nAnswer the customer now using the \
             required JSON format, without calling a tool."
        )
    }
}

/// Deterministic reply listing each product's name, price and description.
pub fn synthesize_reply(products: &[Product]) -> StructuredReply {
    if products.is_empty() {
        return StructuredReply::text(NO_MATCH_REPLY);
    }

    let mut lines = vec!["Here is what I found:".to_string()];
    for product in products {
        let mut line = format!(
            "• {}: {} {}",
            product.name.trim(),
            format_price(product.price),
            product.currency.trim()
        );
        let description = product.description.trim();
        if !description.is_empty() {
            line.push_str(&format!(" ({description})"));
        }
        lines.push(line);
    }

    let images = products
        .iter()
        .filter_map(|product| {
            let url = product.image_url.as_deref()?.trim();
            (!url.is_empty()).then(|| pagebot_common::ReplyImage {
                url: url.to_string(),
                title: product.name.trim().to_string(),
            })
        })
        .collect();

    StructuredReply {
        reply: lines.join("\n"),
        images,
        sentiment: Some("neutral".to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagebot_common::Error;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSearch {
        products: Vec<Product>,
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ProductSearch for FixedSearch {
        async fn search(&self, owner_id: &str, query: &str, page_id: &str) -> Result<Vec<Product>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(owner_id, "owner-1");
            assert_eq!(page_id, "page-1");
            assert!(!query.is_empty());
            if self.fail {
                return Err(Error::Database("catalog offline".to_string()));
            }
            Ok(self.products.clone())
        }
    }

    fn shirt() -> Product {
        Product {
            name: "Red shirt".to_string(),
            price: 500.0,
            currency: "BDT".to_string(),
            description: "Cotton".to_string(),
            image_url: Some("https://cdn.example/red.jpg".to_string()),
            ..Default::default()
        }
    }

    fn response(content: &str, input: u32, output: u32) -> LlmResponse {
        LlmResponse {
            content: content.to_string(),
            model: "m".to_string(),
            usage: TokenUsage::new(input, output),
        }
    }

    fn tool_loop(search: &FixedSearch, direct_synthesis: bool) -> ToolLoop<'_> {
        ToolLoop {
            search,
            owner_id: "owner-1",
            page_id: "page-1",
            direct_synthesis,
        }
    }

    #[tokio::test]
    async fn reinvokes_once_and_merges_usage() {
        let search = FixedSearch {
            products: vec![shirt()],
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let first = response(r#"{"tool":"search_products","query":"red shirt"}"#, 100, 10);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);

        let round = tool_loop(&search, false)
            .run("red shirt", &first, &[ChatMessage::user("red shirt?")], |messages| async move {
                seen_clone.fetch_add(1, Ordering::SeqCst);
                assert_eq!(messages.len(), 3);
                assert!(messages[2].content.contains("Red shirt"));
                Ok(response(r#"{"reply":"We have it for 500 BDT"}"#, 200, 20))
            })
            .await
            .unwrap();

        assert!(round.reinvoked);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(round.usage, TokenUsage::new(300, 30));
        assert!(matches!(round.output, ModelOutput::Reply(ref r) if r.reply.contains("500")));
    }

    #[tokio::test]
    async fn second_tool_call_is_not_honored() {
        let search = FixedSearch {
            products: vec![shirt()],
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let first = response(r#"{"tool":"search_products","query":"shirt"}"#, 1, 1);
        let reinvocations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reinvocations);

        let round = tool_loop(&search, false)
            .run("shirt", &first, &[], |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(response(r#"{"tool":"search_products","query":"more shirts"}"#, 1, 1))
            })
            .await
            .unwrap();

        assert_eq!(reinvocations.load(Ordering::SeqCst), 1);
        assert_eq!(search.calls.load(Ordering::SeqCst), 1);
        let ModelOutput::Reply(reply) = round.output else {
            panic!("expected synthesized reply");
        };
        assert!(reply.reply.contains("Red shirt"));
    }

    #[tokio::test]
    async fn direct_synthesis_skips_second_call() {
        let search = FixedSearch {
            products: vec![shirt()],
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let first = response(r#"{"tool":"search_products","query":"shirt"}"#, 50, 5);

        let reinvocations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reinvocations);

        let round = tool_loop(&search, true)
            .run("shirt", &first, &[], |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(response("{}", 0, 0))
            })
            .await
            .unwrap();

        assert!(!round.reinvoked);
        assert_eq!(reinvocations.load(Ordering::SeqCst), 0);
        assert_eq!(round.usage, TokenUsage::new(50, 5));
        let ModelOutput::Reply(reply) = round.output else {
            panic!("expected synthesized reply");
        };
        assert_eq!(reply.reply, "Here is what I found:\n• Red shirt: 500 BDT (Cotton)");
        assert_eq!(reply.images[0].url, "https://cdn.example/red.jpg");
    }

    #[tokio::test]
    async fn search_failure_still_reinvokes_with_empty_results() {
        let search = FixedSearch {
            products: Vec::new(),
            fail: true,
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let first = response(r#"{"tool":"search_products","query":"shirt"}"#, 1, 1);

        let round = tool_loop(&search, true)
            .run("shirt", &first, &[], |messages| async move {
                assert!(messages[1].content.contains("no matching products"));
                Ok(response(r#"{"reply":"Sorry, not available"}"#, 1, 1))
            })
            .await
            .unwrap();

        assert!(round.reinvoked);
        assert!(round.listing.is_empty());
    }
}
