use async_trait::async_trait;
use datachat::error::Result;
use datachat::filters::{MatchState, Resolution};
use datachat::llm::{ChatMessage, ChatStream};
use datachat::session::Session;
use datachat::similarity::SimilarityScorer;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;

/// Chat stub that replays one scripted delta sequence per streaming call
/// and one canned body per completion call.
struct ScriptedChat {
    scripts: Mutex<VecDeque<Vec<String>>>,
    completions: Mutex<VecDeque<String>>,
    complete_calls: AtomicUsize,
}

impl ScriptedChat {
    fn streaming(scripts: Vec<Vec<&str>>) -> Self {
        Self {
            scripts: Mutex::new(
                scripts
                    .into_iter()
                    .map(|s| s.into_iter().map(String::from).collect())
                    .collect(),
            ),
            completions: Mutex::new(VecDeque::new()),
            complete_calls: AtomicUsize::new(0),
        }
    }

    fn completing(bodies: Vec<&str>) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            completions: Mutex::new(bodies.into_iter().map(String::from).collect()),
            complete_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ChatStream for ScriptedChat {
    async fn stream_chat(
        &self,
        _messages: &[ChatMessage],
        _schema_name: &str,
        _schema: Value,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let deltas = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        let items: Vec<Result<String>> = deltas.into_iter().map(Ok).collect();
        Ok(stream::iter(items).boxed())
    }

    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _schema_name: &str,
        _schema: Value,
    ) -> Result<String> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .completions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }
}

/// Scores a document high when the topic text mentions it.
struct MentionScorer;

#[async_trait]
impl SimilarityScorer for MentionScorer {
    async fn score(&self, docs: &[String], topic: &str) -> Result<Vec<f64>> {
        let topic = topic.to_lowercase();
        Ok(docs
            .iter()
            .map(|d| if topic.contains(&d.to_lowercase()) { 0.92 } else { 0.05 })
            .collect())
    }
}

fn write_fixtures(dir: &TempDir) -> Vec<PathBuf> {
    let products = dir.path().join("products.csv");
    std::fs::write(
        &products,
        "name,country,price\n\
         cocoa bar,Peru,12.5\n\
         dark blend,Ghana,8.0\n\
         single origin,Ecuador,15.0\n\
         andean blend,Peru,11.0\n\
         gold bar,Ghana,13.0\n",
    )
    .unwrap();

    let suppliers = dir.path().join("suppliers.csv");
    std::fs::write(
        &suppliers,
        "supplier,country,rating\n\
         Andes Co,Peru,4.5\n\
         Accra Traders,Ghana,4.0\n\
         Quito Beans,Ecuador,4.2\n",
    )
    .unwrap();

    vec![products, suppliers]
}

const FIRST_RESPONSE: [&str; 4] = [
    r#"{"filters": [{"requirement": "peru and ghana origins", "table": "products", "colu"#,
    r#"mn": "country", "operator": "=", "value": "peru and ghana"}, {"requirement": "price above 10", "#,
    r#""table": "products", "column": "price", "operator": ">", "value": 10}, {"requirement": "peru and ghana origins", "table": "supp"#,
    r#"liers", "column": "country", "operator": "=", "value": "peru and ghana"}]}"#,
];

async fn session_with_data(chat: ScriptedChat) -> Session {
    let dir = TempDir::new().unwrap();
    let files = write_fixtures(&dir);
    let mut session = Session::new(Box::new(chat), Box::new(MentionScorer)).unwrap();
    let report = session.import_files(&files).unwrap();
    assert!(!report.has_errors(), "fixture import must succeed");
    session
}

#[tokio::test]
async fn streamed_extraction_resolves_and_intersects() {
    let chat = ScriptedChat::streaming(vec![FIRST_RESPONSE.to_vec()]);
    let mut session = session_with_data(chat).await;

    let mut snapshots: Vec<usize> = Vec::new();
    let outcome = session
        .extract_filters("chocolate from peru and ghana above 10", |set| {
            snapshots.push(set.len());
        })
        .await
        .unwrap();

    assert!(!outcome.empty);
    assert!(outcome.resolution_failures.is_empty());

    // Partial parses surface progressively and only ever grow.
    assert!(!snapshots.is_empty());
    assert!(snapshots.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*snapshots.last().unwrap(), 3);

    let filters = &session.filters().filters;
    assert_eq!(filters.len(), 3);

    // country columns are low-cardinality text, so their filters resolve
    // fuzzily against actual column contents.
    assert!(filters[0].is_fuzzy());
    assert!(!filters[1].is_fuzzy());
    let accepted: Vec<&str> = filters[0]
        .accepted_matches()
        .iter()
        .map(|m| m.value.as_str())
        .collect();
    assert_eq!(accepted, vec!["Ghana", "Peru"]);

    let applied = session.apply_filters("country");
    assert_eq!(applied.results.len(), 2);
    let products = applied
        .results
        .iter()
        .find(|r| r.table == "products")
        .unwrap();
    assert_eq!(products.outcome.as_ref().unwrap().rows.len(), 3);

    assert_eq!(applied.intersection.values, vec!["Ghana", "Peru"]);
    assert_eq!(applied.intersection.total, 2);
    assert_eq!(
        applied.intersection.tables_considered,
        vec!["products", "suppliers"]
    );
}

#[tokio::test]
async fn disabled_filter_contributes_no_clause() {
    let chat = ScriptedChat::streaming(vec![FIRST_RESPONSE.to_vec()]);
    let mut session = session_with_data(chat).await;
    session
        .extract_filters("chocolate from peru and ghana above 10", |_| {})
        .await
        .unwrap();

    assert!(session.set_disabled(1, true));
    let applied = session.apply_filters("country");
    let products = applied
        .results
        .iter()
        .find(|r| r.table == "products")
        .unwrap();
    // Without the price clause all four Peru/Ghana rows come back.
    assert_eq!(products.outcome.as_ref().unwrap().rows.len(), 4);
}

#[tokio::test]
async fn edited_value_is_rescored_and_small_key_sets_are_skipped() {
    let chat = ScriptedChat::streaming(vec![FIRST_RESPONSE.to_vec()]);
    let mut session = session_with_data(chat).await;
    session
        .extract_filters("chocolate from peru and ghana above 10", |_| {})
        .await
        .unwrap();
    session.set_disabled(1, true);

    let failures = session.edit_filter_value(0, "ecuador").await.unwrap();
    assert!(failures.is_empty());
    let accepted: Vec<&str> = session.filters().filters[0]
        .accepted_matches()
        .iter()
        .map(|m| m.value.as_str())
        .collect();
    assert_eq!(accepted, vec!["Ecuador"]);

    // products now yields a single distinct country, so it drops out of
    // the intersection and only suppliers takes part.
    let applied = session.apply_filters("country");
    assert_eq!(applied.intersection.tables_considered, vec!["suppliers"]);
    assert_eq!(applied.intersection.values, vec!["Ghana", "Peru"]);
}

#[tokio::test]
async fn update_replaces_the_filter_set_wholesale() {
    let chat = ScriptedChat::streaming(vec![
        FIRST_RESPONSE.to_vec(),
        vec![r#"{"filters": [{"requirement": "cheap products", "table": "products", "column": "price", "operator": "<", "value": 9}]}"#],
    ]);
    let mut session = session_with_data(chat).await;
    session
        .extract_filters("chocolate from peru and ghana above 10", |_| {})
        .await
        .unwrap();
    assert_eq!(session.filters().len(), 3);

    let outcome = session
        .update_filters("actually just show me the cheap ones", |_| {})
        .await
        .unwrap();
    assert!(!outcome.empty);
    assert_eq!(session.filters().len(), 1);
    assert!(!session.filters().filters[0].is_fuzzy());
    assert!(matches!(
        session.filters().filters[0].resolution,
        Resolution::Literal
    ));
}

#[tokio::test]
async fn update_without_prior_requirement_is_rejected() {
    let chat = ScriptedChat::streaming(vec![]);
    let mut session = session_with_data(chat).await;
    let err = session.update_filters("tighter please", |_| {}).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn extraction_without_data_is_rejected() {
    let chat = ScriptedChat::streaming(vec![FIRST_RESPONSE.to_vec()]);
    let mut session = Session::new(Box::new(chat), Box::new(MentionScorer)).unwrap();
    let err = session.extract_filters("anything", |_| {}).await;
    assert!(err.is_err());
}

#[tokio::test]
async fn unparseable_stream_yields_empty_outcome() {
    let chat = ScriptedChat::streaming(vec![vec!["sorry, I cannot", " help with that"]]);
    let mut session = session_with_data(chat).await;
    let outcome = session.extract_filters("nonsense", |_| {}).await.unwrap();
    assert!(outcome.empty);
    assert!(session.filters().is_empty());
}

#[tokio::test]
async fn suggested_questions_are_cached_per_dataset() {
    let chat = ScriptedChat::completing(vec![r#"{"questions": ["Which country ships the most?", "What is the price range?"]}"#]);
    let mut session = session_with_data(chat).await;

    let first = session.suggest_questions().await.unwrap();
    assert_eq!(first.len(), 2);
    let second = session.suggest_questions().await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn fuzzy_filter_carries_pending_then_resolved_state() {
    let chat = ScriptedChat::streaming(vec![FIRST_RESPONSE.to_vec()]);
    let mut session = session_with_data(chat).await;
    session
        .extract_filters("chocolate from peru and ghana above 10", |_| {})
        .await
        .unwrap();
    match &session.filters().filters[0].resolution {
        Resolution::Fuzzy { matches, .. } => {
            assert!(matches!(matches, MatchState::Resolved(_)));
        }
        Resolution::Literal => panic!("country filter should be fuzzy"),
    }
}
