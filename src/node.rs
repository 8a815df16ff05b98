use async_trait::async_trait;
use std::sync::Arc;

use crate::bus::{Bus, Exchange};
use crate::chain::Chain;
use crate::config::ROUND_RETRY_DELAY;
use crate::error::ChainError;
use crate::events::{spawn_consumers, EventHub, VoteContext};
use crate::round;
use crate::types::{Block, BlockHeader};

/// Chain bootstrap collaborator. The core only drives it at startup
/// and when finality breaks; discovery and block transfer live out of
/// tree.
#[async_trait]
pub trait Syncer: Send + Sync {
    async fn load(&self) -> Result<(), ChainError> {
        Ok(())
    }

    async fn run(&self) -> Result<(), ChainError> {
        Ok(())
    }
}

pub struct NoopSyncer;

#[async_trait]
impl Syncer for NoopSyncer {}

pub enum Node {
    Validator(Validator),
    Subscriber(Subscriber),
}

impl Node {
    pub async fn run(&self) -> Result<(), ChainError> {
        match self {
            Node::Validator(validator) => validator.run().await,
            Node::Subscriber(subscriber) => subscriber.run().await,
        }
    }
}

/// Bind the broker consumers matching the node's role and build it.
pub fn prepare_node(
    chain: Arc<Chain>,
    hub: Arc<EventHub>,
    bus: Arc<dyn Bus>,
    syncer: Arc<dyn Syncer>,
) -> Result<Node, ChainError> {
    let validator_role = chain.is_validator()?;
    spawn_consumers(hub.clone(), bus.clone(), validator_role);
    Ok(if validator_role {
        Node::Validator(Validator::new(chain, hub, bus, syncer))
    } else {
        Node::Subscriber(Subscriber::new(chain, hub, syncer))
    })
}

// -----------------------------------------------------------------------------
// Validator
// -----------------------------------------------------------------------------

pub struct Validator {
    chain: Arc<Chain>,
    hub: Arc<EventHub>,
    bus: Arc<dyn Bus>,
    syncer: Arc<dyn Syncer>,
}

impl Validator {
    pub fn new(
        chain: Arc<Chain>,
        hub: Arc<EventHub>,
        bus: Arc<dyn Bus>,
        syncer: Arc<dyn Syncer>,
    ) -> Self {
        Validator {
            chain,
            hub,
            bus,
            syncer,
        }
    }

    fn log_information(&self) {
        log::info!("node-mode   : validator");
        log::info!(
            "last-height : {}",
            self.chain.height().unwrap_or_default()
        );
    }

    pub async fn run(&self) -> Result<(), ChainError> {
        self.syncer.load().await?;
        self.syncer.run().await?;
        self.progress().await
    }

    async fn progress(&self) -> Result<(), ChainError> {
        let mut sequence = true;
        loop {
            if sequence {
                self.log_information();
                sequence = false;
            }

            // validator-set setup for the next consensus round
            let (count, faults) = self.chain.get_validator_count()?;
            self.hub.set_info(count, count - faults);

            let permit_header = self
                .chain
                .get_header_from_height(self.chain.height()?)?;
            let prepared = self.chain.prepare_candidate_from_header(&permit_header)?;

            self.hub.transaction.exists().await;
            let Some(candidate) = round::make_candidate(&self.chain, &self.hub, prepared)?
            else {
                continue;
            };

            match self.round(&candidate, &permit_header).await {
                Ok(final_blk) => {
                    log::info!("execution-set: {}", final_blk.transaction_list.len());
                    match self.chain.finalize(&final_blk).await {
                        Ok(()) => {
                            self.hub.clear(&final_blk);
                            sequence = true;
                        }
                        Err(ChainError::Finalize(reason)) => {
                            log::info!("sync-start at {}: {}", final_blk.height(), reason);
                            self.syncer.run().await?;
                        }
                        Err(err) => log::error!("finalize failed: {}", err),
                    }
                }
                Err(ChainError::Finalize(reason)) => {
                    log::info!(
                        "sync-start at {}: {}",
                        self.chain.height().unwrap_or_default(),
                        reason
                    );
                    self.syncer.run().await?;
                }
                Err(ChainError::Backlog) => {
                    if let Err(err) = self.accumulated().await {
                        match err {
                            ChainError::Finalize(reason) => {
                                log::info!("sync-start on backlog: {}", reason);
                                self.syncer.run().await?;
                            }
                            other => log::error!("catch-up failed: {}", other),
                        }
                    }
                }
                Err(err) => log::error!("round failed: {}", err),
            }
        }
    }

    /// One height worth of LLFC, retried until a finalized block is
    /// produced or adopted from the finalize queue.
    async fn round(
        &self,
        candidate: &Block,
        permit_header: &BlockHeader,
    ) -> Result<Block, ChainError> {
        loop {
            match self.phases(candidate, permit_header).await {
                Ok((confirm_blk, vote_ctx)) => {
                    if let Some(final_blk) =
                        round::make_finalize_from_confirm(&self.chain, confirm_blk, &vote_ctx)
                            .await?
                    {
                        log::info!("make-finalize: {}", final_blk.height());
                        self.bus
                            .publish(Exchange::Finalize, final_blk.to_json()?)
                            .await?;
                    }
                    self.hub.finalize.exists().await?;
                    return match self.hub.finalize.get(permit_header.height + 1)? {
                        Some(block) => Ok(block),
                        None => {
                            Err(ChainError::Round("finalize block missing".to_string()))
                        }
                    };
                }
                Err(err @ ChainError::Round(_)) => {
                    log::error!("fall outside the normal way, reason: {}", err);
                    match self.hub.finalize.get(permit_header.height + 1) {
                        Ok(Some(block)) => return Ok(block),
                        Ok(None) => {
                            self.hub.reset();
                            tokio::time::sleep(ROUND_RETRY_DELAY).await;
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(ChainError::Validation(reason)) => {
                    log::error!("validation error, reason: {}", reason);
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// P0 through P3 against the shared event queues.
    async fn phases(
        &self,
        candidate: &Block,
        permit_header: &BlockHeader,
    ) -> Result<(Block, VoteContext), ChainError> {
        self.bus
            .publish(Exchange::Candidate, candidate.to_json()?)
            .await?;
        self.hub.candidate.exists().await?;

        let context = round::select_candidate(&self.chain, &self.hub, permit_header)?;
        let select_blk = context
            .first_block()
            .ok_or_else(|| ChainError::Round("no candidate selected".to_string()))?;
        log::debug!("select-blk: {}", select_blk.pre_hash());

        let vote = round::make_vote(&self.chain, &select_blk)?;
        log::debug!("make-vote : {}", vote.candidate_block_hash);
        self.bus.publish(Exchange::Vote, vote.to_json()?).await?;
        self.hub.vote.exists().await?;

        let (aggregated, vote_ctx) =
            round::aggregate_vote(&self.chain, &self.hub, &select_blk.header)?;
        let confirm =
            round::make_confirm(&self.chain, permit_header.height + 1, &aggregated)?;
        self.bus
            .publish(Exchange::Confirm, confirm.to_wire()?)
            .await?;
        self.hub.confirm.exists().await?;

        let confirm_blk = round::aggregate_confirm(&self.chain, &self.hub, &confirm)?;
        Ok((confirm_blk, vote_ctx))
    }

    /// Drain a finalize backlog in height order.
    async fn accumulated(&self) -> Result<(), ChainError> {
        log::info!(
            "accumulated block processing... start at {}",
            self.chain.height()?
        );
        loop {
            let permit_header = self
                .chain
                .get_header_from_height(self.chain.height()?)?;
            match self.hub.finalize.get(permit_header.height + 1)? {
                None => return Ok(()),
                Some(block) => {
                    self.chain.finalize(&block).await?;
                    self.hub.clear(&block);
                }
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Subscriber
// -----------------------------------------------------------------------------

/// Consumes finalized blocks only; skips the propose/vote/confirm
/// phases entirely.
pub struct Subscriber {
    chain: Arc<Chain>,
    hub: Arc<EventHub>,
    syncer: Arc<dyn Syncer>,
}

impl Subscriber {
    pub fn new(chain: Arc<Chain>, hub: Arc<EventHub>, syncer: Arc<dyn Syncer>) -> Self {
        Subscriber { chain, hub, syncer }
    }

    fn log_information(&self) {
        log::info!("node-mode   : subscriber");
        log::info!(
            "last-height : {}",
            self.chain.height().unwrap_or_default()
        );
    }

    pub async fn run(&self) -> Result<(), ChainError> {
        self.syncer.load().await?;
        self.syncer.run().await?;
        loop {
            self.log_information();
            let permit_header = self
                .chain
                .get_header_from_height(self.chain.height()?)?;

            match self.hub.finalize.exists().await {
                Err(ChainError::Backlog) => {
                    if let Err(err) = self.accumulated().await {
                        match err {
                            ChainError::Finalize(reason) => {
                                log::info!("sync-start on backlog: {}", reason);
                                self.syncer.run().await?;
                            }
                            other => log::error!("catch-up failed: {}", other),
                        }
                    }
                }
                Err(err) => log::error!("finalize wait failed: {}", err),
                Ok(()) => match self.hub.finalize.get(permit_header.height + 1) {
                    Ok(Some(block)) => match self.chain.finalize(&block).await {
                        Ok(()) => self.hub.clear(&block),
                        Err(ChainError::Finalize(reason)) => {
                            log::info!("sync-start at {}: {}", block.height(), reason);
                            self.syncer.run().await?;
                        }
                        Err(err) => log::error!("finalize failed: {}", err),
                    },
                    Ok(None) => {}
                    Err(ChainError::Finalize(reason)) => {
                        log::info!("sync-start: {}", reason);
                        self.syncer.run().await?;
                    }
                    Err(err) => return Err(err),
                },
            }
        }
    }

    async fn accumulated(&self) -> Result<(), ChainError> {
        log::info!(
            "accumulated block processing... start at {}",
            self.chain.height()?
        );
        loop {
            let permit_header = self
                .chain
                .get_header_from_height(self.chain.height()?)?;
            match self.hub.finalize.get(permit_header.height + 1)? {
                None => return Ok(()),
                Some(block) => match self.chain.finalize(&block).await {
                    Ok(()) => self.hub.clear(&block),
                    Err(ChainError::Validation(reason)) => {
                        log::error!("invalid finalize block skipped: {}", reason);
                    }
                    Err(err) => return Err(err),
                },
            }
        }
    }
}
