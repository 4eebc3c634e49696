//! Time bounds for tool calls, model calls and whole requests.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tower::{BoxError, Layer, Service, ServiceExt};

use crate::error::{AgentError, TimeoutScope};

/// Bound `fut` by `after`; dropping it on expiry cancels whatever it was awaiting.
pub async fn with_timeout<T, E, F>(scope: TimeoutScope, after: Duration, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<AgentError>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(res) => res,
        Err(_) => Err(AgentError::Timeout { scope, after }.into()),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    scope: TimeoutScope,
    after: Duration,
}

impl TimeoutLayer {
    pub fn new(scope: TimeoutScope, after: Duration) -> Self {
        Self { scope, after }
    }
}

#[derive(Debug, Clone)]
pub struct Timeout<S> {
    inner: S,
    scope: TimeoutScope,
    after: Duration,
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = Timeout<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Timeout {
            inner,
            scope: self.scope,
            after: self.after,
        }
    }
}

impl<S, Req> Service<Req> for Timeout<S>
where
    Req: Send + 'static,
    S: Service<Req, Error = BoxError> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let inner = self.inner.clone();
        let (scope, after) = (self.scope, self.after);
        Box::pin(with_timeout(scope, after, inner.oneshot(req)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{classify, ErrorKind};
    use tower::service_fn;

    #[tokio::test(start_paused = true)]
    async fn slow_calls_surface_a_scoped_timeout() {
        let mut svc = TimeoutLayer::new(TimeoutScope::Tool, Duration::from_millis(50)).layer(
            service_fn(|_: ()| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, BoxError>("late")
            }),
        );
        let err = svc.ready().await.unwrap().call(()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AgentError>(),
            Some(AgentError::Timeout { scope: TimeoutScope::Tool, after }) if *after == Duration::from_millis(50)
        ));
        assert_eq!(classify(&err), ErrorKind::Transient);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_calls_pass_through() {
        let mut svc = TimeoutLayer::new(TimeoutScope::ModelCall, Duration::from_secs(1))
            .layer(service_fn(|x: u8| async move { Ok::<_, BoxError>(x + 1) }));
        assert_eq!(svc.ready().await.unwrap().call(1).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_drops_the_inner_future() {
        struct Flag(std::sync::Arc<std::sync::atomic::AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }
        let dropped = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Flag(dropped.clone());
        let res: Result<(), AgentError> =
            with_timeout(TimeoutScope::Request, Duration::from_millis(10), async move {
                let _flag = flag;
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(AgentError::Timeout { scope: TimeoutScope::Request, .. })));
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }
}
