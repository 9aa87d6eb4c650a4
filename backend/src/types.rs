use quote_consensus::{
    BatchReport, CanonicalKey, FeedId, FeedOutcome, OracleKey, QueueId, RawOracleResponse, Stage,
    StoredState,
};
use serde::{Deserialize, Serialize};

/// A batch of signed oracle responses, as returned by a gateway.
///
/// Responses may arrive as a JSON list, as one hex-encoded bundle, or both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub responses: Vec<RawOracleResponse>,

    /// Hex-encoded response bundle
    pub bundle: Option<String>,

    /// Restrict the update to these feeds
    pub feeds: Option<Vec<FeedId>>,
}

/// Result of one update batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSummary {
    pub queue: QueueId,

    /// Key of the quote account the updated feeds map to
    pub canonical_key: CanonicalKey,

    pub accepted: Vec<StoredState>,
    pub rejected: Vec<RejectedFeed>,
    pub dropped: Vec<DroppedInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedFeed {
    pub feed_id: FeedId,
    /// Last stage the feed completed
    pub stage: Stage,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroppedInput {
    pub oracle: OracleKey,
    pub feed_id: Option<FeedId>,
    pub stage: Stage,
    pub reason: String,
}

impl UpdateSummary {
    pub fn from_report(report: &BatchReport, canonical_key: CanonicalKey) -> Self {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();

        for (feed_id, outcome) in &report.outcomes {
            match outcome {
                FeedOutcome::Accepted(state) => accepted.push(state.clone()),
                FeedOutcome::Rejected { stage, error } => rejected.push(RejectedFeed {
                    feed_id: *feed_id,
                    stage: *stage,
                    reason: error.to_string(),
                }),
            }
        }

        let dropped = report
            .dropped
            .iter()
            .map(|d| DroppedInput {
                oracle: d.oracle,
                feed_id: d.feed_id,
                stage: d.stage,
                reason: d.reason.to_string(),
            })
            .collect();

        Self {
            queue: report.queue,
            canonical_key,
            accepted,
            rejected,
            dropped,
        }
    }
}

/// Running totals since the service started
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    pub batches_processed: u64,
    pub feeds_accepted: u64,
    pub feeds_rejected: u64,
    pub inputs_dropped: u64,
    pub last_update_slot: Option<u64>,
}

impl ServiceStats {
    pub fn record(&mut self, summary: &UpdateSummary) {
        self.batches_processed += 1;
        self.feeds_accepted += summary.accepted.len() as u64;
        self.feeds_rejected += summary.rejected.len() as u64;
        self.inputs_dropped += summary.dropped.len() as u64;
        if let Some(slot) = summary.accepted.iter().map(|s| s.slot).max() {
            self.last_update_slot = Some(self.last_update_slot.map_or(slot, |s| s.max(slot)));
        }
    }
}
