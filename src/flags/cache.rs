//! Caching of server-evaluated feature flags.
//!
//! Evaluating flags on the server costs a network round trip, and a single inbound request often
//! checks several flags for the same user. A [`FeatureFlagCache`] memoizes the server's answer for
//! a [`FlagCacheKey`] (distinct id, person properties and groups).
//!
//! The crate ships two implementations:
//!
//! - [`NullFeatureFlagCache`] (the default) never caches.
//! - [`RequestScopedFeatureFlagCache`] stores results in the [`RequestScope`] of the request being
//!   served, so the cache lives exactly as long as the request. Outside of a request scope it
//!   behaves like `NullFeatureFlagCache`.
//!
//! Web frameworks integrate by creating a `RequestScope` per request and exposing it through a
//! [`ScopeAccessor`]. The simplest way is to enter the scope on the thread handling the request:
//!
//! ```
//! # use std::sync::Arc;
//! # use posthog::RequestScope;
//! let scope = Arc::new(RequestScope::new());
//! let _guard = RequestScope::enter(&scope);
//! // ... handle the request; flags evaluated here are cached in `scope` ...
//! ```
use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    marker::PhantomData,
    sync::{Arc, Mutex},
};

use crate::{flags::FeatureFlags, Groups, Properties, Result};

/// Identifies a server evaluation: the same key always yields the same flags within a request.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagCacheKey {
    /// Distinct id of the evaluated user.
    pub distinct_id: String,
    /// Person properties sent for evaluation.
    pub person_properties: Properties,
    /// Groups (with properties) sent for evaluation.
    pub groups: Groups,
}

impl FlagCacheKey {
    pub(crate) fn new(distinct_id: &str, person_properties: &Properties, groups: &Groups) -> Self {
        FlagCacheKey {
            distinct_id: distinct_id.to_owned(),
            person_properties: person_properties.clone(),
            groups: groups.clone(),
        }
    }

    /// Deterministic string form of the key, independent of map iteration order.
    pub fn cache_key(&self) -> String {
        let person_properties: BTreeMap<_, _> = self.person_properties.iter().collect();
        let groups: BTreeMap<_, _> = self
            .groups
            .iter()
            .map(|group| {
                let properties: BTreeMap<_, _> = group.properties.iter().collect();
                (&group.group_type, (&group.group_key, properties))
            })
            .collect();

        format!(
            "$posthog(feature_flags):{}:{}:{}",
            self.distinct_id,
            serde_json::to_string(&person_properties).unwrap_or_default(),
            serde_json::to_string(&groups).unwrap_or_default(),
        )
    }
}

/// A cache of server-evaluated feature flags.
pub trait FeatureFlagCache {
    /// Return cached flags for `key`, or call `fetch` and (possibly) cache its result.
    ///
    /// # Errors
    ///
    /// Errors returned by `fetch` are propagated and must not be cached.
    fn get_or_fetch(
        &self,
        key: &FlagCacheKey,
        fetch: &dyn Fn() -> Result<FeatureFlags>,
    ) -> Result<Arc<FeatureFlags>>;
}

/// A cache that never caches.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullFeatureFlagCache;

impl FeatureFlagCache for NullFeatureFlagCache {
    fn get_or_fetch(
        &self,
        _key: &FlagCacheKey,
        fetch: &dyn Fn() -> Result<FeatureFlags>,
    ) -> Result<Arc<FeatureFlags>> {
        fetch().map(Arc::new)
    }
}

/// Key/value storage whose lifetime is one inbound request.
#[derive(Debug, Default)]
pub struct RequestScope {
    items: Mutex<HashMap<String, Arc<FeatureFlags>>>,
}

thread_local! {
    static CURRENT_SCOPES: RefCell<Vec<Arc<RequestScope>>> = const { RefCell::new(Vec::new()) };
}

impl RequestScope {
    /// Create an empty scope.
    pub fn new() -> RequestScope {
        RequestScope::default()
    }

    /// Make `scope` the current scope of this thread until the returned guard is dropped.
    ///
    /// Scopes nest: entering a scope while another is active shadows it.
    pub fn enter(scope: &Arc<RequestScope>) -> ScopeGuard {
        CURRENT_SCOPES.with(|scopes| scopes.borrow_mut().push(Arc::clone(scope)));
        ScopeGuard {
            _not_send: PhantomData,
        }
    }

    /// The innermost scope entered on this thread.
    pub fn current() -> Option<Arc<RequestScope>> {
        CURRENT_SCOPES.with(|scopes| scopes.borrow().last().cloned())
    }

    fn get(&self, key: &str) -> Option<Arc<FeatureFlags>> {
        let items = self.items.lock().ok()?;
        items.get(key).cloned()
    }

    fn insert(&self, key: String, flags: Arc<FeatureFlags>) {
        if let Ok(mut items) = self.items.lock() {
            items.insert(key, flags);
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    /// Return `true` if nothing is cached in this scope.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Leaves the scope entered with [`RequestScope::enter`] on drop.
#[must_use = "the scope is left when the guard is dropped"]
pub struct ScopeGuard {
    // Pops a thread-local stack, so it must be dropped on the thread that created it.
    _not_send: PhantomData<*const ()>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        CURRENT_SCOPES.with(|scopes| {
            scopes.borrow_mut().pop();
        });
    }
}

/// Gives access to the scope of the request currently being served, if any.
pub trait ScopeAccessor {
    /// The current request scope, or `None` outside of a request.
    fn current_scope(&self) -> Option<Arc<RequestScope>>;
}

impl<F: Fn() -> Option<Arc<RequestScope>>> ScopeAccessor for F {
    fn current_scope(&self) -> Option<Arc<RequestScope>> {
        self()
    }
}

/// Resolves the scope entered on the current thread with [`RequestScope::enter`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadLocalScopeAccessor;

impl ScopeAccessor for ThreadLocalScopeAccessor {
    fn current_scope(&self) -> Option<Arc<RequestScope>> {
        RequestScope::current()
    }
}

/// Caches server-evaluated flags in the current [`RequestScope`].
#[derive(Debug, Default, Clone)]
pub struct RequestScopedFeatureFlagCache<A> {
    accessor: A,
}

impl<A: ScopeAccessor> RequestScopedFeatureFlagCache<A> {
    /// Create a cache resolving request scopes with `accessor`.
    pub fn new(accessor: A) -> Self {
        RequestScopedFeatureFlagCache { accessor }
    }
}

impl<A: ScopeAccessor> FeatureFlagCache for RequestScopedFeatureFlagCache<A> {
    fn get_or_fetch(
        &self,
        key: &FlagCacheKey,
        fetch: &dyn Fn() -> Result<FeatureFlags>,
    ) -> Result<Arc<FeatureFlags>> {
        let Some(scope) = self.accessor.current_scope() else {
            log::trace!(target: "posthog", "no request scope, feature flags are not cached");
            return NullFeatureFlagCache.get_or_fetch(key, fetch);
        };

        let cache_key = key.cache_key();
        if let Some(flags) = scope.get(&cache_key) {
            log::trace!(target: "posthog", distinct_id = key.distinct_id.as_str(); "feature flags cache hit");
            return Ok(flags);
        }

        let flags = Arc::new(fetch()?);
        scope.insert(cache_key, Arc::clone(&flags));
        Ok(flags)
    }
}
