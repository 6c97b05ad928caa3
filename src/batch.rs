//! Windowed concurrent execution of queued requests.
//!
//! Requests are drained from a FIFO queue in rounds of at most `concurrency`
//! items. Each round runs on one multi transport, retries its failed slots
//! until none are left, finalizes every slot and only then yields its
//! responses, so output order always matches enqueue order.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use http::Method;
use tracing::{debug, info_span, warn};

use crate::Result;
use crate::config::RequestConfig;
use crate::handle::TransferHandle;
use crate::response::Response;
use crate::transport::{MultiTransport, Transport};

pub const DEFAULT_CONCURRENCY: usize = 5;

/// Upper bound on retry passes inside one round, independent of `max_retry`.
pub const MAX_RETRY_ROUNDS: usize = 64;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const POLL_FAILURE_SLEEP: Duration = Duration::from_millis(10);

pub struct BatchScheduler {
    transport: Arc<dyn Transport>,
    defaults: RequestConfig,
    concurrency: usize,
    pending: VecDeque<RequestConfig>,
    pool: Vec<TransferHandle>,
}

impl fmt::Debug for BatchScheduler {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("BatchScheduler")
            .field("concurrency", &self.concurrency)
            .field("pending", &self.pending.len())
            .field("pool", &self.pool.len())
            .finish()
    }
}

impl BatchScheduler {
    pub fn new(transport: Arc<dyn Transport>, defaults: RequestConfig) -> Self {
        Self {
            transport,
            defaults,
            concurrency: DEFAULT_CONCURRENCY,
            pending: VecDeque::new(),
            pool: Vec::new(),
        }
    }

    /// Values below 1 are raised to 1.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queues a request. Merging with the defaults and validation happen
    /// here; nothing is sent until [`BatchScheduler::run_all`].
    pub fn enqueue(
        &mut self,
        method: Method,
        url: impl Into<String>,
        config: RequestConfig,
    ) -> Result<()> {
        let config = RequestConfig::merge(&self.defaults, &config.method(method).url(url));
        config.build_full_url()?;
        self.pending.push_back(config);
        Ok(())
    }

    /// Runs every queued request. Responses are yielded in enqueue order; a
    /// request whose configuration cannot be applied yields an error in its
    /// place without affecting the others.
    pub fn run_all(&mut self) -> BatchRun<'_> {
        let multi = self.transport.create_multi();
        BatchRun {
            scheduler: self,
            multi,
            ready: VecDeque::new(),
            round: 0,
        }
    }

    pub fn collect_all(&mut self) -> Vec<Result<Response>> {
        self.run_all().collect()
    }

    fn ensure_pool(&mut self, size: usize) {
        while self.pool.len() < size {
            self.pool
                .push(TransferHandle::new(Arc::clone(&self.transport)));
        }
    }
}

/// Iterator over the responses of one [`BatchScheduler::run_all`] call.
pub struct BatchRun<'a> {
    scheduler: &'a mut BatchScheduler,
    multi: Box<dyn MultiTransport>,
    ready: VecDeque<Result<Response>>,
    round: usize,
}

impl fmt::Debug for BatchRun<'_> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("BatchRun")
            .field("round", &self.round)
            .field("ready", &self.ready.len())
            .field("pending", &self.scheduler.pending.len())
            .finish()
    }
}

impl Iterator for BatchRun<'_> {
    type Item = Result<Response>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.ready.is_empty() && !self.scheduler.pending.is_empty() {
            self.run_round();
        }
        self.ready.pop_front()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.ready.len() + self.scheduler.pending.len();
        (remaining, Some(remaining))
    }
}

impl BatchRun<'_> {
    fn run_round(&mut self) {
        let size = self
            .scheduler
            .concurrency
            .min(self.scheduler.pending.len());
        let configs = self.scheduler.pending.drain(..size).collect::<Vec<_>>();
        self.scheduler.ensure_pool(size);
        self.round += 1;

        let span = info_span!("reqpool.batch_round", round = self.round, size = size);
        let _enter = span.enter();
        debug!("starting batch round");

        let mut results: Vec<Option<Result<Response>>> = (0..size).map(|_| None).collect();
        let mut in_flight = Vec::with_capacity(size);
        for (slot, config) in configs.iter().enumerate() {
            let handle = &mut self.scheduler.pool[slot];
            handle.reset();
            let submitted = handle
                .apply_configuration(config)
                .and_then(|()| handle.take_handle());
            match submitted {
                Ok(transport_handle) => {
                    self.multi.add(slot, transport_handle);
                    in_flight.push(slot);
                }
                Err(error) => results[slot] = Some(Err(error)),
            }
        }

        let mut retry_rounds = 0;
        while !in_flight.is_empty() {
            self.drain_multi();

            let mut failed = Vec::new();
            for slot in in_flight.drain(..) {
                let completed = self.multi.remove(slot);
                let handle = &mut self.scheduler.pool[slot];
                let response = handle.complete(completed);
                if retry_rounds < MAX_RETRY_ROUNDS && handle.can_retry() {
                    failed.push((slot, response));
                } else {
                    results[slot] = Some(Ok(response));
                }
            }
            if failed.is_empty() {
                break;
            }

            retry_rounds += 1;
            for (slot, response) in failed {
                let handle = &mut self.scheduler.pool[slot];
                handle.finalize(None);
                let mut config = handle.config().clone();
                let retry_count = config.advance_retry();
                warn!(
                    slot = slot,
                    status = response.status_code(),
                    error = %response.error_code(),
                    retry_count = retry_count,
                    timeout_ms = config.get_timeout().as_millis() as u64,
                    "retrying batch request"
                );
                handle.reset();
                let submitted = handle
                    .apply_configuration(&config)
                    .and_then(|()| handle.take_handle());
                match submitted {
                    Ok(transport_handle) => {
                        self.multi.add(slot, transport_handle);
                        in_flight.push(slot);
                    }
                    Err(error) => results[slot] = Some(Err(error)),
                }
            }
        }

        for (slot, result) in results.into_iter().enumerate() {
            let Some(result) = result else {
                continue;
            };
            if let Ok(response) = &result {
                self.scheduler.pool[slot].finalize(Some(response));
            }
            self.ready.push_back(result);
        }
    }

    /// Drives the multi transport until nothing in it is running.
    fn drain_multi(&mut self) {
        loop {
            if self.multi.perform() == 0 {
                break;
            }
            if let Err(error) = self.multi.poll(POLL_INTERVAL) {
                warn!(error = %error, "multi transport poll failed");
                thread::sleep(POLL_FAILURE_SLEEP);
            }
        }
    }
}
