//! Render Worker Pool.
//!
//! A fixed budget of browser sessions shared by all render tasks. A task
//! holds one worker permit for its whole life (retries included), borrows an
//! idle session or opens a new one, and returns the session afterwards unless
//! it failed at the session level, in which case the session is closed and a
//! later task opens a replacement. Every session operation runs under the
//! task's absolute deadline.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time::{Instant, timeout, timeout_at},
};
use tracing::{debug, info, warn};
use url::Url;

use super::{
    breaker::{BreakerSnapshot, CircuitBreaker},
    engine::{BrowserEngine, BrowserSession, NetworkEvent, PageContent, WaitCondition},
    types::{PoolConfig, RenderError},
};
use crate::{
    application::interceptor::ResourceInterceptor,
    cache::lock::mutex_lock,
    domain::render::{
        InterceptStats, RenderPriority, RenderResult, RenderTask, TaskState, WaitTier,
    },
};

const SOURCE: &str = "application::render::pool";
const SESSION_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

const METRIC_RENDER: &str = "prerender_render_total";
const METRIC_RENDER_SECONDS: &str = "prerender_render_duration_seconds";
const METRIC_RENDER_RETRIES: &str = "prerender_render_retries_total";
const METRIC_POOL_SESSIONS: &str = "prerender_pool_sessions";
const METRIC_INTERCEPTED: &str = "prerender_interceptor_requests_total";

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub max_concurrency: usize,
    pub available_workers: usize,
    pub live_sessions: usize,
    pub idle_sessions: usize,
    pub breaker: BreakerSnapshot,
}

struct Rendered {
    content: PageContent,
    wait_tier: WaitTier,
    intercepted: InterceptStats,
}

pub struct RenderPool {
    engine: Arc<dyn BrowserEngine>,
    config: PoolConfig,
    workers: Arc<Semaphore>,
    background: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn BrowserSession>>>,
    live_sessions: AtomicUsize,
    breaker: CircuitBreaker,
}

impl RenderPool {
    pub fn new(engine: Arc<dyn BrowserEngine>, config: PoolConfig) -> Self {
        let max_concurrency = config.max_concurrency.max(1);
        let background = config.background_concurrency.clamp(1, max_concurrency);

        info!(
            target = "rendergate::render::pool",
            max_concurrency,
            background_concurrency = background,
            max_retries = config.max_retries,
            task_deadline_ms = config.task_deadline.as_millis() as u64,
            "Render worker pool initialised"
        );

        Self {
            engine,
            workers: Arc::new(Semaphore::new(max_concurrency)),
            background: Arc::new(Semaphore::new(background)),
            idle: Mutex::new(Vec::with_capacity(max_concurrency)),
            live_sessions: AtomicUsize::new(0),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Build a task carrying this pool's retry limit and deadline.
    pub fn task(&self, url: Url, priority: RenderPriority) -> RenderTask {
        RenderTask::new(
            url,
            priority,
            self.config.max_retries,
            self.config.task_deadline,
        )
    }

    /// Render under the caller's interceptor, which carries the profile's
    /// block rules. Fails fast with
    /// [`RenderError::BreakerOpen`] while the breaker rejects submissions.
    pub async fn submit_with(
        &self,
        mut task: RenderTask,
        interceptor: Arc<ResourceInterceptor>,
    ) -> Result<RenderResult, RenderError> {
        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(err) => {
                counter!(METRIC_RENDER, "result" => err.kind()).increment(1);
                debug!(
                    target = "rendergate::render::pool",
                    op = "render",
                    task_id = %task.id,
                    url = %task.url,
                    result = "rejected",
                    error_code = err.kind(),
                    "Render rejected by circuit breaker"
                );
                return Err(err);
            }
        };

        let started = Instant::now();
        let outcome = self.execute(&mut task, &interceptor).await;
        let elapsed = started.elapsed();
        histogram!(METRIC_RENDER_SECONDS).record(elapsed.as_secs_f64());

        match outcome {
            Ok(rendered) => {
                permit.success();
                task.state = TaskState::Succeeded;
                counter!(METRIC_RENDER, "result" => "success").increment(1);
                counter!(METRIC_INTERCEPTED, "decision" => "allowed")
                    .increment(rendered.intercepted.allowed);
                counter!(METRIC_INTERCEPTED, "decision" => "blocked")
                    .increment(rendered.intercepted.blocked);
                info!(
                    target = "rendergate::render::pool",
                    op = "render",
                    task_id = %task.id,
                    url = %task.url,
                    priority = task.priority.as_str(),
                    result = "success",
                    status = rendered.content.status,
                    attempts = task.attempt,
                    wait_tier = rendered.wait_tier.as_str(),
                    blocked = rendered.intercepted.blocked,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Render finished"
                );
                Ok(RenderResult {
                    task_id: task.id,
                    url: task.url,
                    html: rendered.content.html,
                    status_code: rendered.content.status,
                    attempts: task.attempt,
                    wait_tier: rendered.wait_tier,
                    elapsed,
                    intercepted: rendered.intercepted,
                })
            }
            Err(err) => {
                if err.counts_against_breaker() {
                    permit.failure();
                } else {
                    drop(permit);
                }
                task.state = TaskState::Failed;
                counter!(METRIC_RENDER, "result" => err.kind()).increment(1);
                warn!(
                    target = "rendergate::render::pool",
                    op = "render",
                    task_id = %task.id,
                    url = %task.url,
                    priority = task.priority.as_str(),
                    result = "failure",
                    attempts = task.attempt,
                    error_code = err.kind(),
                    error = %err,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Render failed"
                );
                Err(err)
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_concurrency: self.config.max_concurrency.max(1),
            available_workers: self.workers.available_permits(),
            live_sessions: self.live_sessions.load(Ordering::Acquire),
            idle_sessions: mutex_lock(&self.idle, SOURCE, "stats").len(),
            breaker: self.breaker.snapshot(),
        }
    }

    /// Close every idle session.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = mutex_lock(&self.idle, SOURCE, "shutdown").drain(..).collect();
        for session in sessions {
            self.destroy(session).await;
        }
    }

    async fn execute(
        &self,
        task: &mut RenderTask,
        interceptor: &Arc<ResourceInterceptor>,
    ) -> Result<Rendered, RenderError> {
        let _background = match task.priority {
            RenderPriority::Background => Some(self.admit(&self.background, task).await?),
            RenderPriority::Foreground => None,
        };
        let _worker = self.admit(&self.workers, task).await?;
        task.state = TaskState::Running;

        loop {
            task.attempt += 1;
            match self.attempt(task, interceptor).await {
                Ok(rendered) => return Ok(rendered),
                Err(err) if err.is_retryable() && task.has_retries_left() => {
                    let delay = self.config.backoff.delay(task.attempt);
                    if delay >= task.remaining() {
                        return Err(err);
                    }
                    counter!(METRIC_RENDER_RETRIES, "kind" => err.kind()).increment(1);
                    debug!(
                        target = "rendergate::render::pool",
                        op = "retry",
                        task_id = %task.id,
                        attempt = task.attempt,
                        error_code = err.kind(),
                        delay_ms = delay.as_millis() as u64,
                        "Retrying render"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn admit(
        &self,
        gate: &Arc<Semaphore>,
        task: &RenderTask,
    ) -> Result<OwnedSemaphorePermit, RenderError> {
        let wait = self.config.queue_timeout.min(task.remaining());
        match timeout(wait, Arc::clone(gate).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_closed)) => Err(RenderError::unknown("worker pool closed")),
            Err(_) => Err(RenderError::QueueTimeout {
                waited_ms: wait.as_millis() as u64,
            }),
        }
    }

    async fn attempt(
        &self,
        task: &RenderTask,
        interceptor: &Arc<ResourceInterceptor>,
    ) -> Result<Rendered, RenderError> {
        let mut session = match timeout_at(task.deadline, self.checkout()).await {
            Ok(session) => session?,
            Err(_) => return Err(RenderError::timeout("session open")),
        };

        let outcome = match timeout_at(
            task.deadline,
            self.drive(session.as_mut(), task, interceptor),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(RenderError::timeout("deadline")),
        };

        match &outcome {
            Err(err) if err.poisons_session() => self.destroy(session).await,
            _ => self.release(session),
        }
        outcome
    }

    async fn drive(
        &self,
        session: &mut dyn BrowserSession,
        task: &RenderTask,
        interceptor: &Arc<ResourceInterceptor>,
    ) -> Result<Rendered, RenderError> {
        session.navigate(&task.url, Arc::clone(interceptor)).await?;
        let wait_tier = self.wait_for_completion(session, task).await?;
        let content = session.content().await?;
        let intercepted = tally(&session.network_events());
        Ok(Rendered {
            content,
            wait_tier,
            intercepted,
        })
    }

    /// Try each completion signal in turn; a tier that times out falls
    /// through to the next, more relaxed one.
    async fn wait_for_completion(
        &self,
        session: &mut dyn BrowserSession,
        task: &RenderTask,
    ) -> Result<WaitTier, RenderError> {
        let quiet = self.config.idle_quiet;
        let tiers = [
            WaitCondition::NetworkIdle { quiet },
            WaitCondition::NetworkQuiet { quiet },
            WaitCondition::DomReady {
                grace: self.config.dom_grace,
            },
        ];

        for condition in tiers {
            let budget = match condition {
                WaitCondition::DomReady { grace } => self.config.wait_timeout + grace,
                _ => self.config.wait_timeout,
            };
            match timeout(budget, session.wait_for(condition, self.config.wait_timeout)).await {
                Ok(Ok(())) => return Ok(condition.tier()),
                Ok(Err(RenderError::Timeout { .. })) | Err(_) => {
                    debug!(
                        target = "rendergate::render::pool",
                        op = "wait",
                        task_id = %task.id,
                        tier = condition.tier().as_str(),
                        "Wait tier timed out"
                    );
                }
                Ok(Err(err)) => return Err(err),
            }
        }
        Err(RenderError::timeout("page load"))
    }

    async fn checkout(&self) -> Result<Box<dyn BrowserSession>, RenderError> {
        let reused = mutex_lock(&self.idle, SOURCE, "checkout").pop();
        if let Some(session) = reused {
            return Ok(session);
        }

        let session = self.engine.open_session().await?;
        let live = self.live_sessions.fetch_add(1, Ordering::AcqRel) + 1;
        gauge!(METRIC_POOL_SESSIONS).set(live as f64);
        Ok(session)
    }

    fn release(&self, session: Box<dyn BrowserSession>) {
        mutex_lock(&self.idle, SOURCE, "release").push(session);
    }

    async fn destroy(&self, session: Box<dyn BrowserSession>) {
        if timeout(SESSION_CLOSE_TIMEOUT, session.close()).await.is_err() {
            warn!(
                target = "rendergate::render::pool",
                op = "close_session",
                result = "timeout",
                "Browser session did not close in time"
            );
        }
        let live = self
            .live_sessions
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1);
        gauge!(METRIC_POOL_SESSIONS).set(live as f64);
    }
}

fn tally(events: &[NetworkEvent]) -> InterceptStats {
    events
        .iter()
        .fold(InterceptStats::default(), |mut stats, event| {
            if event.blocked {
                stats.blocked += 1;
            } else {
                stats.allowed += 1;
            }
            stats
        })
}
