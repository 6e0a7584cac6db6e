//! One-shot historical backfill.
//!
//! The ranger parses `[from, to]` once and exits. `to` is the tip seen at
//! startup; the observer takes over at `to + 1`.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::ledger::BlockId;
use crate::sync::parser::{drive_range, BlockParser, DriveOutcome};

/// Inclusive block range to backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangePlan {
    pub from: BlockId,
    pub to: BlockId,
}

/// Compute the backfill range.
///
/// `from` is the earlier of `cursor + 1` and the operator override. With
/// neither there is nothing to backfill. An empty range yields `None`.
pub fn plan(cursor: Option<BlockId>, override_from: Option<BlockId>, tip: BlockId) -> Option<RangePlan> {
    let resume = cursor.map(|c| c.next());
    let from = match (resume, override_from) {
        (Some(r), Some(o)) => r.min(o),
        (Some(r), None) => r,
        (None, Some(o)) => o,
        (None, None) => return None,
    };
    (from <= tip).then_some(RangePlan { from, to: tip })
}

pub struct BlockRanger {
    parser: BlockParser,
    plan: RangePlan,
    retry_delay: Duration,
}

impl BlockRanger {
    pub fn new(parser: BlockParser, plan: RangePlan, retry_delay: Duration) -> Self {
        Self {
            parser,
            plan,
            retry_delay,
        }
    }

    /// Parse the whole range, then stop for good.
    pub async fn run(self, cancel: CancellationToken) -> DriveOutcome {
        tracing::info!(from = %self.plan.from, to = %self.plan.to, "Backfill starting");
        let mut next = self.plan.from;
        let outcome = drive_range(&self.parser, &mut next, self.plan.to, self.retry_delay, &cancel).await;
        match outcome {
            DriveOutcome::Completed => tracing::info!(to = %self.plan.to, "Backfill complete"),
            _ => tracing::info!(next = %next, outcome = ?outcome, "Backfill stopped early"),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::parser::tests::FakeChain;
    use crate::sync::parser::{Feed, Origin};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn b(n: u64) -> BlockId {
        BlockId::from_u64(n)
    }

    #[test]
    fn test_plan() {
        assert_eq!(plan(Some(b(10)), None, b(20)), Some(RangePlan { from: b(11), to: b(20) }));
        assert_eq!(plan(Some(b(10)), Some(b(5)), b(20)), Some(RangePlan { from: b(5), to: b(20) }));
        // The override never skips blocks the cursor has not covered.
        assert_eq!(plan(Some(b(10)), Some(b(15)), b(20)), Some(RangePlan { from: b(11), to: b(20) }));
        assert_eq!(plan(None, Some(b(3)), b(4)), Some(RangePlan { from: b(3), to: b(4) }));
        assert_eq!(plan(None, None, b(20)), None);
        assert_eq!(plan(Some(b(20)), None, b(20)), None);
    }

    #[tokio::test]
    async fn test_ranger_covers_range_once() {
        let chain = Arc::new(FakeChain::default());
        for id in 3..=6 {
            chain.insert(id, &[]);
        }
        let (tx, mut rx) = mpsc::channel(16);
        let parser = BlockParser::new(chain, Origin::Backfill, tx);
        let ranger = BlockRanger::new(parser, RangePlan { from: b(3), to: b(6) }, Duration::from_millis(10));

        assert_eq!(ranger.run(CancellationToken::new()).await, DriveOutcome::Completed);

        let mut ids = Vec::new();
        while let Ok(Feed::Progress(p)) = rx.try_recv() {
            assert_eq!(p.origin, Origin::Backfill);
            ids.push(p.block_id);
        }
        assert_eq!(ids, vec![b(3), b(4), b(5), b(6)]);
    }
}
