//! Purpose: Accumulate utility tokens per build and join the extraction work that feeds them.
//! Exports: `TokenSet`, `FrozenTokens`, `ExtractionScheduler`.
//! Role: Build-session state shared by module transforms (writers) and finalize (single reader).
//! Invariants: The token set only grows while open; `freeze` closes it for good.
//! Invariants: The outstanding-work list is drained exactly once; scheduling after that fails.
//! Invariants: A failed extraction fails the drain; no partial token set is ever handed out.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::{Error, ErrorKind};
use crate::generator::StyleGenerator;

#[derive(Debug, Default)]
struct TokenState {
    tokens: BTreeSet<String>,
    modules: BTreeMap<String, BTreeSet<String>>,
    frozen: bool,
}

/// Shared, append-only token set. Clones share the same underlying set.
#[derive(Clone, Debug, Default)]
pub struct TokenSet {
    inner: Arc<Mutex<TokenState>>,
}

impl TokenSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TokenState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns whether the token was new to the build.
    pub fn insert(&self, module: &str, token: impl Into<String>) -> Result<bool, Error> {
        self.extend(module, [token.into()]).map(|added| added > 0)
    }

    /// Returns how many tokens were new to the build.
    pub fn extend<I, S>(&self, module: &str, tokens: I) -> Result<usize, Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state();
        if state.frozen {
            return Err(Error::new(ErrorKind::Closed)
                .with_message("token set is frozen")
                .with_module(module));
        }
        let state = &mut *state;
        let per_module = state.modules.entry(module.to_string()).or_default();
        let mut added = 0;
        for token in tokens {
            let token = token.into();
            per_module.insert(token.clone());
            if state.tokens.insert(token) {
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn len(&self) -> usize {
        self.state().tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, token: &str) -> bool {
        self.state().tokens.contains(token)
    }

    pub fn module_tokens(&self, module: &str) -> Vec<String> {
        self.state()
            .modules
            .get(module)
            .map(|tokens| tokens.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_frozen(&self) -> bool {
        self.state().frozen
    }

    /// Closes the set and returns a read-only snapshot of it.
    pub fn freeze(&self) -> FrozenTokens {
        let mut state = self.state();
        state.frozen = true;
        FrozenTokens {
            tokens: Arc::new(state.tokens.clone()),
            modules: Arc::new(state.modules.clone()),
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FrozenTokens {
    tokens: Arc<BTreeSet<String>>,
    modules: Arc<BTreeMap<String, BTreeSet<String>>>,
}

impl FrozenTokens {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.contains(token)
    }

    pub fn module_tokens(&self, module: &str) -> Option<&BTreeSet<String>> {
        self.modules.get(module)
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }
}

type ExtractionTasks = JoinSet<Result<(), Error>>;

/// Fire-and-collect extraction: `schedule` spawns and returns at once, `drain` is the barrier.
pub struct ExtractionScheduler {
    generator: Arc<dyn StyleGenerator>,
    tokens: TokenSet,
    tasks: Mutex<Option<ExtractionTasks>>,
    scheduled: AtomicUsize,
}

impl ExtractionScheduler {
    pub fn new(generator: Arc<dyn StyleGenerator>, tokens: TokenSet) -> Self {
        Self {
            generator,
            tokens,
            tasks: Mutex::new(Some(JoinSet::new())),
            scheduled: AtomicUsize::new(0),
        }
    }

    pub fn tokens(&self) -> &TokenSet {
        &self.tokens
    }

    pub fn scheduled(&self) -> usize {
        self.scheduled.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Spawns extraction of `code` on the current tokio runtime.
    pub fn schedule(&self, code: String, id: String) -> Result<(), Error> {
        let handle = Handle::try_current().map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("extraction needs a running tokio runtime")
                .with_module(id.clone())
                .with_source(err)
        })?;

        let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tasks) = guard.as_mut() else {
            return Err(Error::new(ErrorKind::Closed)
                .with_message("extraction scheduled after finalize started")
                .with_module(id));
        };

        let generator = Arc::clone(&self.generator);
        let tokens = self.tokens.clone();
        debug!(module = %id, bytes = code.len(), "scheduling extraction");
        tasks.spawn_on(
            async move {
                let result = generator.extract(&code, &id, &tokens).await;
                result.map_err(|err| match err.module() {
                    Some(_) => err,
                    None => err.with_module(id),
                })
            },
            &handle,
        );
        self.scheduled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Closes the work list, awaits every task and freezes the token set.
    ///
    /// The first failed task fails the drain; tasks still running are aborted.
    pub async fn drain(&self) -> Result<FrozenTokens, Error> {
        let taken = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut tasks) = taken else {
            return Err(Error::new(ErrorKind::Closed).with_message("extraction already drained"));
        };

        let mut settled = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => settled += 1,
                Ok(Err(err)) => return Err(err),
                Err(err) => {
                    return Err(Error::new(ErrorKind::Internal)
                        .with_message("extraction task did not complete")
                        .with_source(err));
                }
            }
        }

        let frozen = self.tokens.freeze();
        debug!(settled, tokens = frozen.len(), "extraction drained");
        Ok(frozen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{GenerateOptions, GeneratedCss, LayeredCss};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Splits code on whitespace; `fail` anywhere in the code fails extraction.
    struct WordGenerator {
        delay: Duration,
    }

    #[async_trait]
    impl StyleGenerator for WordGenerator {
        async fn extract(&self, code: &str, id: &str, tokens: &TokenSet) -> Result<(), Error> {
            tokio::time::sleep(self.delay).await;
            if code.contains("fail") {
                return Err(Error::new(ErrorKind::Extraction).with_message("bad source"));
            }
            tokens.extend(id, code.split_whitespace())?;
            Ok(())
        }

        async fn generate(
            &self,
            _tokens: &FrozenTokens,
            _options: GenerateOptions,
        ) -> Result<Box<dyn GeneratedCss>, Error> {
            Ok(Box::new(LayeredCss::new()))
        }
    }

    fn scheduler(delay_ms: u64) -> ExtractionScheduler {
        ExtractionScheduler::new(
            Arc::new(WordGenerator {
                delay: Duration::from_millis(delay_ms),
            }),
            TokenSet::new(),
        )
    }

    #[test]
    fn token_set_tracks_modules() {
        let tokens = TokenSet::new();
        assert!(tokens.insert("a.ux", "flex").expect("insert"));
        assert!(!tokens.insert("b.ux", "flex").expect("insert"));
        assert_eq!(tokens.extend("b.ux", ["p-1", "m-2"]).expect("extend"), 2);
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens.module_tokens("b.ux"), vec!["flex", "m-2", "p-1"]);
        assert!(tokens.module_tokens("c.ux").is_empty());
    }

    #[test]
    fn frozen_set_rejects_inserts() {
        let tokens = TokenSet::new();
        tokens.insert("a.ux", "flex").expect("insert");
        let frozen = tokens.freeze();
        assert!(tokens.is_frozen());
        assert_eq!(frozen.len(), 1);
        let err = tokens.insert("a.ux", "grid").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
        assert_eq!(tokens.len(), 1);
    }

    #[test]
    fn scheduling_outside_a_runtime_fails() {
        let scheduler = scheduler(0);
        let err = scheduler
            .schedule("flex".to_string(), "a.ux".to_string())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(scheduler.scheduled(), 0);
    }

    #[tokio::test]
    async fn drain_waits_for_every_extraction() {
        let scheduler = scheduler(20);
        for i in 0..16 {
            scheduler
                .schedule(format!("tok-{i} shared"), format!("m{i}.ux"))
                .expect("schedule");
        }
        assert_eq!(scheduler.scheduled(), 16);
        // Nothing has settled yet: every task is still sleeping.
        assert!(scheduler.tokens().len() < 17);

        let frozen = scheduler.drain().await.expect("drain");
        assert_eq!(frozen.len(), 17);
        assert!(frozen.contains("shared"));
        assert_eq!(frozen.modules().count(), 16);
        assert!(scheduler.is_closed());
    }

    #[tokio::test]
    async fn schedule_after_drain_is_rejected() {
        let scheduler = scheduler(0);
        scheduler.drain().await.expect("drain");
        let err = scheduler
            .schedule("flex".to_string(), "late.ux".to_string())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
        assert_eq!(err.module(), Some("late.ux"));

        let err = scheduler.drain().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
    }

    #[tokio::test]
    async fn failed_extraction_fails_the_drain() {
        let scheduler = scheduler(5);
        scheduler
            .schedule("flex".to_string(), "ok.ux".to_string())
            .expect("schedule");
        scheduler
            .schedule("fail here".to_string(), "broken.ux".to_string())
            .expect("schedule");

        let err = scheduler.drain().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Extraction);
        assert_eq!(err.module(), Some("broken.ux"));
    }
}
