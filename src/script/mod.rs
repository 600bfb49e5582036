//! The script registry (spec §4.11, §2.6): a language-agnostic facade over
//! pluggable script/predicate backends, with SHA-256-memoized compilation.

pub mod native;

use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::Args;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("language {0:?} is not a valid identifier")]
    LanguageNotValid(String),

    #[error("language {0:?} has no registered environment")]
    UnsupportedLanguage(String),

    #[error("compile error: {0}")]
    Compile(String),

    #[error("execution error: {0}")]
    Execute(String),
}

/// An opaque handle to one compiled script, as produced by a specific
/// [`ScriptEnvironment`]. Environments downcast it back to their own
/// artifact type.
#[derive(Clone)]
pub struct Compiled(Arc<dyn Any + Send + Sync>);

impl Compiled {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

/// A pluggable script/predicate backend. Real deployments wire in
/// Ale/Lua/JPath-backed implementations; the core ships only [`native`].
pub trait ScriptEnvironment: Send + Sync {
    fn validate(&self, source: &str) -> Result<(), ScriptError>;
    fn compile(&self, source: &str, arg_names: &[String]) -> Result<Compiled, ScriptError>;
    fn execute_script(&self, compiled: &Compiled, inputs: &Args) -> Result<Args, ScriptError>;
    fn evaluate_predicate(&self, compiled: &Compiled, inputs: &Args) -> Result<bool, ScriptError>;
    /// Whether this environment may be used as a `Script`-typed step's body
    /// (spec §3 invariant iii: JPath-like environments may only back
    /// predicates, not full script steps).
    fn supports_script_steps(&self) -> bool {
        true
    }
}

fn cache_key(language: &str, source: &str, arg_names: &[String]) -> [u8; 32] {
    let mut sorted = arg_names.to_vec();
    sorted.sort();
    let mut hasher = Sha256::new();
    hasher.update(language.as_bytes());
    hasher.update([0u8]);
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(sorted.join(",").as_bytes());
    hasher.finalize().into()
}

/// Registry of script environments plus a memoized compile cache keyed by
/// SHA-256 of `script || 0x00 || sorted-arg-names`.
pub struct ScriptRegistry {
    environments: Mutex<std::collections::HashMap<String, Arc<dyn ScriptEnvironment>>>,
    cache: Mutex<LruCache<[u8; 32], Compiled>>,
}

impl ScriptRegistry {
    pub fn new(cache_capacity: usize) -> Self {
        let mut registry = Self {
            environments: Mutex::new(std::collections::HashMap::new()),
            cache: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(cache_capacity.max(1)).unwrap(),
            )),
        };
        registry.register("native", Arc::new(native::NativeEnvironment));
        registry
    }

    pub fn register(&mut self, language: &str, env: Arc<dyn ScriptEnvironment>) {
        self.environments
            .get_mut()
            .insert(language.to_string(), env);
    }

    pub fn get(&self, language: &str) -> Result<Arc<dyn ScriptEnvironment>, ScriptError> {
        if language.trim().is_empty() {
            return Err(ScriptError::LanguageNotValid(language.to_string()));
        }
        self.environments
            .lock()
            .get(language)
            .cloned()
            .ok_or_else(|| ScriptError::UnsupportedLanguage(language.to_string()))
    }

    /// Compile `source` under `language`, reusing a cached artifact when the
    /// (language, source, arg-names) triple has been seen before.
    pub fn compile(
        &self,
        language: &str,
        source: &str,
        arg_names: &[String],
    ) -> Result<Compiled, ScriptError> {
        let key = cache_key(language, source, arg_names);
        if let Some(hit) = self.cache.lock().get(&key) {
            return Ok(hit.clone());
        }
        let env = self.get(language)?;
        env.validate(source)?;
        let compiled = env.compile(source, arg_names)?;
        self.cache.lock().put(key, compiled.clone());
        Ok(compiled)
    }
}

/// Helper used by callers that want a quick structural hash for logging
/// (not part of the memoization key itself).
pub fn debug_fingerprint(source: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}
