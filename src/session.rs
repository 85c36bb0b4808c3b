//! Explicit session context.
//!
//! One `Session` owns the store, the derived catalog, the live filter
//! set, and the conversation history, and every pipeline operation goes
//! through it. Nothing in the crate keeps ambient global state.

use crate::catalog::Catalog;
use crate::compiler::{self, Intersection, TableQueryResult};
use crate::conversation::{Conversation, ConversationState};
use crate::error::{DataChatError, Result};
use crate::filters::{Filter, FilterSet, Resolution};
use crate::ingest::{self, ImportReport};
use crate::llm::{self, ChatStream, FilterDraft};
use crate::similarity::{self, ResolutionFailure, SimilarityScorer};
use crate::store::{TabularStore, TableInfo};
use std::path::PathBuf;
use tracing::info;

/// Result of one "apply filters" action: per-table outcomes plus the key
/// intersection. Ephemeral; rebuilt on every apply.
#[derive(Debug)]
pub struct ApplyOutcome {
    pub results: Vec<TableQueryResult>,
    pub intersection: Intersection,
}

/// Result of one extraction or update cycle.
#[derive(Debug)]
pub struct ExtractionOutcome {
    /// True when the stream never produced a parseable filter set.
    pub empty: bool,
    /// Per-filter similarity failures, reported inline.
    pub resolution_failures: Vec<ResolutionFailure>,
}

pub struct Session {
    store: TabularStore,
    catalog: Catalog,
    filters: FilterSet,
    conversation: Conversation,
    chat: Box<dyn ChatStream>,
    scorer: Box<dyn SimilarityScorer>,
    questions_cache: Option<(String, Vec<String>)>,
}

impl Session {
    pub fn new(chat: Box<dyn ChatStream>, scorer: Box<dyn SimilarityScorer>) -> Result<Self> {
        Ok(Self {
            store: TabularStore::open()?,
            catalog: Catalog::default(),
            filters: FilterSet::default(),
            conversation: Conversation::new(),
            chat,
            scorer,
            questions_cache: None,
        })
    }

    pub fn filters(&self) -> &FilterSet {
        &self.filters
    }

    pub fn schema(&self) -> Result<Vec<TableInfo>> {
        self.store.schema()
    }

    /// Import files and rebuild the catalog over the changed dataset.
    pub fn import_files(&mut self, paths: &[PathBuf]) -> Result<ImportReport> {
        let report = ingest::import_files(&self.store, paths);
        self.catalog = Catalog::build(&self.store)?;
        Ok(report)
    }

    /// Suggested questions for the current schema, recomputed only when
    /// the dataset changes.
    pub async fn suggest_questions(&mut self) -> Result<Vec<String>> {
        let fingerprint = self.catalog.fingerprint();
        if let Some((cached_fp, questions)) = &self.questions_cache {
            if *cached_fp == fingerprint {
                return Ok(questions.clone());
            }
        }
        let questions =
            llm::suggest_questions(self.chat.as_ref(), &self.catalog.prompt_context()).await?;
        self.questions_cache = Some((fingerprint, questions.clone()));
        Ok(questions)
    }

    /// Run filter extraction for a new requirement. Starts a fresh
    /// conversation cycle: any prior history is discarded in favor of the
    /// new requirement.
    pub async fn extract_filters<F>(
        &mut self,
        requirement: &str,
        observer: F,
    ) -> Result<ExtractionOutcome>
    where
        F: FnMut(&FilterSet) + Send,
    {
        if self.catalog.columns.is_empty() {
            return Err(DataChatError::Session(
                "No data loaded; import files before extracting filters".to_string(),
            ));
        }
        self.conversation.reset();
        self.conversation
            .seed(&self.catalog.prompt_context(), requirement);
        self.run_extraction(observer).await
    }

    /// Re-run extraction conditioned on the prior exchange plus a new
    /// instruction. The resulting set replaces the current one wholesale.
    pub async fn update_filters<F>(
        &mut self,
        instruction: &str,
        observer: F,
    ) -> Result<ExtractionOutcome>
    where
        F: FnMut(&FilterSet) + Send,
    {
        if self.conversation.state() != ConversationState::Active {
            return Err(DataChatError::Session(
                "No active conversation; submit a requirement first".to_string(),
            ));
        }
        self.conversation.follow_up(&self.filters.summary(), instruction);
        self.run_extraction(observer).await
    }

    async fn run_extraction<F>(&mut self, mut observer: F) -> Result<ExtractionOutcome>
    where
        F: FnMut(&FilterSet) + Send,
    {
        let messages = self.conversation.messages().to_vec();
        let chat = self.chat.as_ref();
        let catalog = &self.catalog;
        let filters = &mut self.filters;

        let drafts = llm::extract_filters(chat, &messages, |partial: &[FilterDraft]| {
            // Progressive disclosure: every good partial parse replaces
            // the live set and is surfaced immediately.
            *filters = build_filter_set(partial, catalog);
            observer(filters);
        })
        .await?;

        self.filters = build_filter_set(&drafts, &self.catalog);
        let empty = self.filters.is_empty();
        if empty {
            info!("extraction produced no filters");
        }

        let resolution_failures =
            similarity::resolve_pending(&mut self.filters, &self.store, self.scorer.as_ref())
                .await;
        Ok(ExtractionOutcome {
            empty,
            resolution_failures,
        })
    }

    pub fn set_disabled(&mut self, idx: usize, disabled: bool) -> bool {
        self.filters.set_disabled(idx, disabled)
    }

    /// Threshold change is a pure re-render input; nothing is re-fetched.
    pub fn set_min_similarity(&mut self, idx: usize, threshold: f64) -> bool {
        self.filters.set_min_similarity(idx, threshold)
    }

    /// Edit a filter's value and re-resolve that filter only.
    pub async fn edit_filter_value(
        &mut self,
        idx: usize,
        value: &str,
    ) -> Result<Vec<ResolutionFailure>> {
        if !self.filters.edit_value(idx, value) {
            return Err(DataChatError::Session(format!("No filter at index {}", idx)));
        }
        Ok(
            similarity::resolve_one(&mut self.filters, &self.store, self.scorer.as_ref(), idx)
                .await,
        )
    }

    /// Compile and run the enabled filters, intersecting `key` across the
    /// per-table results.
    pub fn apply_filters(&self, key: &str) -> ApplyOutcome {
        let plans = compiler::plan_queries(&self.filters);
        let results = compiler::execute_plans(&self.store, &plans);
        let intersection = compiler::intersect_key(&results, key);
        ApplyOutcome {
            results,
            intersection,
        }
    }
}

/// Bind extracted drafts to the catalog: a filter on an enum/embedding
/// column resolves fuzzily, everything else literally.
fn build_filter_set(drafts: &[FilterDraft], catalog: &Catalog) -> FilterSet {
    let filters = drafts
        .iter()
        .map(|draft| {
            let fuzzy = catalog
                .category_of(&draft.table, &draft.column)
                .map(|c| c.is_fuzzy())
                .unwrap_or(false);
            Filter {
                requirement: draft.requirement.clone(),
                table: draft.table.clone(),
                column: draft.column.clone(),
                operator: draft.operator,
                value: draft.value_string(),
                disabled: false,
                resolution: if fuzzy {
                    Resolution::fuzzy()
                } else {
                    Resolution::Literal
                },
            }
        })
        .collect();
    FilterSet::new(filters)
}
