use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tonic::{Request, Status};

/// Type-erased tonic interceptor as stored in an [`InterceptorChain`].
pub type DynInterceptor = Arc<dyn Fn(Request<()>) -> Result<Request<()>, Status> + Send + Sync>;

/// Erases any cloneable tonic interceptor.
pub fn interceptor<I>(interceptor: I) -> DynInterceptor
where
    I: tonic::service::Interceptor + Clone + Send + Sync + 'static,
{
    Arc::new(move |request| interceptor.clone().call(request))
}

/// Ordered chain of named items.
///
/// Every mutation returns `false` instead of changing the chain when the
/// named item is missing (or, for inserts, when the new name is taken).
///
/// ```ignore
/// let mut chain = InterceptorChain::new();
/// chain.push("a", a);
/// chain.push("b", b);
/// chain.insert_after("a", "c", c); // a -> c -> b
/// ```
pub struct InterceptorChain<T> {
    order: Vec<String>,
    items: HashMap<String, T>,
}

impl<T> Default for InterceptorChain<T> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            items: HashMap::new(),
        }
    }
}

impl<T: Clone> Clone for InterceptorChain<T> {
    fn clone(&self) -> Self {
        Self {
            order: self.order.clone(),
            items: self.items.clone(),
        }
    }
}

impl<T> fmt::Debug for InterceptorChain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.order).finish()
    }
}

impl<T> InterceptorChain<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }

    /// Appends to the end of the chain.
    pub fn push(&mut self, name: impl Into<String>, item: T) -> bool {
        let name = name.into();
        if self.exists(&name) {
            return false;
        }
        self.order.push(name.clone());
        self.items.insert(name, item);
        true
    }

    /// Inserts immediately before `before`.
    pub fn insert_before(&mut self, before: &str, name: impl Into<String>, item: T) -> bool {
        let Some(index) = self.position(before) else {
            return false;
        };
        self.insert_at(index, name.into(), item)
    }

    /// Inserts immediately after `after`.
    pub fn insert_after(&mut self, after: &str, name: impl Into<String>, item: T) -> bool {
        let Some(index) = self.position(after) else {
            return false;
        };
        self.insert_at(index + 1, name.into(), item)
    }

    /// Swaps the item stored under `name`, keeping its position.
    pub fn replace(&mut self, name: &str, item: T) -> bool {
        match self.items.get_mut(name) {
            Some(slot) => {
                *slot = item;
                true
            }
            None => false,
        }
    }

    pub fn delete(&mut self, name: &str) -> bool {
        if self.items.remove(name).is_none() {
            return false;
        }
        self.order.retain(|n| n != name);
        true
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.order
            .iter()
            .filter_map(|name| self.items.get(name).map(|item| (name.as_str(), item)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.order.iter().position(|n| n == name)
    }

    fn insert_at(&mut self, index: usize, name: String, item: T) -> bool {
        if self.exists(&name) {
            return false;
        }
        self.order.insert(index, name.clone());
        self.items.insert(name, item);
        true
    }
}

impl InterceptorChain<DynInterceptor> {
    /// Freezes the current order into a single tonic interceptor.
    pub fn commit(&self) -> ChainInterceptor {
        ChainInterceptor {
            steps: self
                .iter()
                .map(|(name, item)| (name.to_string(), item.clone()))
                .collect(),
        }
    }
}

/// Committed chain; runs each step in order and stops at the first error.
#[derive(Clone)]
pub struct ChainInterceptor {
    steps: Arc<[(String, DynInterceptor)]>,
}

impl ChainInterceptor {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|(name, _)| name.as_str())
    }
}

impl fmt::Debug for ChainInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChainInterceptor")
            .field(&self.names().collect::<Vec<_>>())
            .finish()
    }
}

impl tonic::service::Interceptor for ChainInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        for (name, step) in self.steps.iter() {
            request = step(request).inspect_err(|status| {
                tracing::debug!(
                    target: "grpc_platform",
                    interceptor = %name,
                    code = ?status.code(),
                    "interceptor rejected request"
                );
            })?;
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::service::Interceptor;

    fn names<T>(chain: &InterceptorChain<T>) -> Vec<&str> {
        chain.names().collect()
    }

    fn chain_ab() -> InterceptorChain<u8> {
        let mut chain = InterceptorChain::new();
        assert!(chain.push("a", 1));
        assert!(chain.push("b", 2));
        chain
    }

    #[test]
    fn test_push_rejects_duplicates() {
        let mut chain = chain_ab();
        assert!(!chain.push("a", 9));
        assert_eq!(names(&chain), ["a", "b"]);
        assert_eq!(chain.iter().next(), Some(("a", &1)));
    }

    #[test]
    fn test_insert_before() {
        let mut chain = chain_ab();
        assert!(chain.insert_before("b", "c", 3));
        assert_eq!(names(&chain), ["a", "c", "b"]);

        assert!(chain.insert_before("a", "d", 4));
        assert_eq!(names(&chain), ["d", "a", "c", "b"]);
    }

    #[test]
    fn test_insert_after() {
        let mut chain = chain_ab();
        assert!(chain.insert_after("a", "c", 3));
        assert_eq!(names(&chain), ["a", "c", "b"]);

        assert!(chain.insert_after("b", "d", 4));
        assert_eq!(names(&chain), ["a", "c", "b", "d"]);
    }

    #[test]
    fn test_insert_fails_on_missing_anchor_or_taken_name() {
        let mut chain = chain_ab();
        assert!(!chain.insert_before("x", "c", 3));
        assert!(!chain.insert_after("x", "c", 3));
        assert!(!chain.insert_after("a", "b", 3));
        assert_eq!(names(&chain), ["a", "b"]);
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut chain = chain_ab();
        assert!(chain.replace("a", 10));
        assert!(!chain.replace("x", 10));
        let items: Vec<_> = chain.iter().collect();
        assert_eq!(items, [("a", &10), ("b", &2)]);
    }

    #[test]
    fn test_delete() {
        let mut chain = chain_ab();
        assert!(chain.delete("a"));
        assert!(!chain.delete("a"));
        assert_eq!(names(&chain), ["b"]);
        assert_eq!(chain.len(), 1);
    }

    fn tag(value: &'static str) -> DynInterceptor {
        Arc::new(move |mut request: Request<()>| -> Result<Request<()>, Status> {
            request
                .metadata_mut()
                .append("x-step", value.parse().map_err(|_| Status::internal("bad value"))?);
            Ok(request)
        })
    }

    #[test]
    fn test_commit_runs_in_order() {
        let mut chain = InterceptorChain::new();
        chain.push("first", tag("1"));
        chain.push("third", tag("3"));
        chain.insert_before("third", "second", tag("2"));

        let mut committed = chain.commit();
        let request = committed.call(Request::new(())).unwrap();
        let steps: Vec<_> = request
            .metadata()
            .get_all("x-step")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(steps, ["1", "2", "3"]);
    }

    #[test]
    fn test_commit_stops_at_first_error() {
        let mut chain = InterceptorChain::new();
        let deny: DynInterceptor = Arc::new(|_: Request<()>| -> Result<Request<()>, Status> {
            Err(Status::permission_denied("no"))
        });
        chain.push("deny", deny);
        chain.push("tag", tag("never"));

        let status = chain.commit().call(Request::new(())).unwrap_err();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
    }

    #[test]
    fn test_commit_is_a_snapshot() {
        let mut chain = InterceptorChain::new();
        chain.push("a", tag("a"));
        let committed = chain.commit();
        chain.push("b", tag("b"));
        assert_eq!(committed.names().collect::<Vec<_>>(), ["a"]);
    }
}
