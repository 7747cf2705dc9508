//! Per-session negotiation worker
//!
//! Every description operation and every remote candidate for a session goes
//! through one worker task, so at most one `createOffer` / `createAnswer` /
//! `setLocalDescription` / `setRemoteDescription` is in flight per session
//! and candidates are applied in arrival order. Outcomes are posted back to
//! the engine tagged with the session generation; the engine drops outcomes
//! whose generation is no longer current.

use crate::engine::EngineEvent;
use crate::error::NegotiationError;
use crate::peer::transport::TransportHandle;
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::session::CandidateQueue;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Work submitted to the worker
#[derive(Debug)]
pub enum Step {
    /// Produce an offer and set it as local description
    Offer,
    /// Apply a remote offer, then produce and set an answer
    Answer(SessionDescription),
    /// Apply a remote answer
    ApplyAnswer(SessionDescription),
    /// Apply now, or queue until the remote description is set
    Candidate(IceCandidate),
}

/// Result of a description step
#[derive(Debug)]
pub enum StepOutcome {
    OfferReady(SessionDescription),
    AnswerReady(SessionDescription),
    AnswerApplied,
    Failed(NegotiationError),
}

/// Engine-side handle; dropping it aborts the worker, including queued steps
#[derive(Debug)]
pub struct NegotiatorHandle {
    tx: mpsc::UnboundedSender<Step>,
    task: AbortHandle,
}

impl Drop for NegotiatorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl NegotiatorHandle {
    pub fn submit(&self, step: Step) {
        if let Err(e) = self.tx.send(step) {
            tracing::debug!("negotiation worker gone, dropping {:?}", e.0);
        }
    }
}

struct Negotiator {
    generation: u64,
    transport: Arc<dyn TransportHandle>,
    queue: CandidateQueue,
    remote_applied: bool,
    timeout: Option<Duration>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

/// Starts the worker for one session.
pub fn spawn(
    generation: u64,
    transport: Arc<dyn TransportHandle>,
    timeout: Option<Duration>,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> NegotiatorHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = Negotiator {
        generation,
        transport,
        queue: CandidateQueue::default(),
        remote_applied: false,
        timeout,
        events,
    };
    let task = tokio::spawn(worker.run(rx)).abort_handle();
    NegotiatorHandle { tx, task }
}

async fn bounded<T, F>(limit: Option<Duration>, fut: F) -> Result<T, NegotiationError>
where
    F: Future<Output = Result<T, NegotiationError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| NegotiationError::Timeout(limit))?,
        None => fut.await,
    }
}

impl Negotiator {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Step>) {
        while let Some(step) = rx.recv().await {
            let outcome = match step {
                Step::Candidate(candidate) => {
                    self.candidate(candidate).await;
                    continue;
                }
                Step::Offer => match self.offer().await {
                    Ok(offer) => StepOutcome::OfferReady(offer),
                    Err(e) => StepOutcome::Failed(e),
                },
                Step::Answer(offer) => match self.answer(offer).await {
                    Ok(answer) => StepOutcome::AnswerReady(answer),
                    Err(e) => StepOutcome::Failed(e),
                },
                Step::ApplyAnswer(answer) => match self.apply_remote(answer).await {
                    Ok(()) => StepOutcome::AnswerApplied,
                    Err(e) => StepOutcome::Failed(e),
                },
            };
            self.report(outcome);
        }
        tracing::debug!(generation = self.generation, "negotiation worker stopped");
    }

    fn report(&self, outcome: StepOutcome) {
        let generation = self.generation;
        if self
            .events
            .send(EngineEvent::Step {
                generation,
                outcome,
            })
            .is_err()
        {
            tracing::debug!(generation, "engine gone, dropping negotiation outcome");
        }
    }

    async fn offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        let offer = bounded(self.timeout, self.transport.create_offer()).await?;
        bounded(
            self.timeout,
            self.transport.set_local_description(offer.clone()),
        )
        .await?;
        Ok(offer)
    }

    async fn answer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        self.apply_remote(offer).await?;
        let answer = bounded(self.timeout, self.transport.create_answer()).await?;
        bounded(
            self.timeout,
            self.transport.set_local_description(answer.clone()),
        )
        .await?;
        Ok(answer)
    }

    /// Sets the remote description and flushes queued candidates.
    async fn apply_remote(&mut self, desc: SessionDescription) -> Result<(), NegotiationError> {
        bounded(self.timeout, self.transport.set_remote_description(desc)).await?;
        let first = !self.remote_applied;
        self.remote_applied = true;
        if first && !self.queue.is_empty() {
            let pending: Vec<_> = self.queue.drain().collect();
            tracing::debug!(
                generation = self.generation,
                count = pending.len(),
                "applying queued remote candidates"
            );
            for candidate in pending {
                self.add(candidate).await;
            }
        }
        Ok(())
    }

    async fn candidate(&mut self, candidate: IceCandidate) {
        if self.remote_applied {
            self.add(candidate).await;
        } else {
            self.queue.push(candidate);
            tracing::debug!(
                generation = self.generation,
                queued = self.queue.len(),
                "remote description not set yet, queuing candidate"
            );
        }
    }

    async fn add(&self, candidate: IceCandidate) {
        let line = candidate.candidate.clone();
        match bounded(self.timeout, self.transport.add_candidate(candidate)).await {
            Ok(()) => tracing::debug!(generation = self.generation, candidate = %line, "remote candidate added"),
            Err(e) => tracing::warn!(generation = self.generation, candidate = %line, "failed to add remote candidate: {e}"),
        }
    }
}
