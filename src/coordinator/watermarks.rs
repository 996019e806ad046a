//! Applied / durable watermarks and token correlation

use crate::oplog::OpTime;
use crate::storage::JournalToken;
use serde::Serialize;
use std::collections::VecDeque;

/// Local end-of-log positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Watermarks {
    /// Last batch end applied to storage
    pub last_applied: OpTime,
    /// Last batch end confirmed durable
    pub last_durable: OpTime,
}

impl Watermarks {
    pub fn advance_applied(&mut self, op_time: OpTime) -> bool {
        if op_time > self.last_applied {
            self.last_applied = op_time;
            true
        } else {
            false
        }
    }

    pub fn advance_durable(&mut self, op_time: OpTime) -> bool {
        if op_time > self.last_durable {
            self.last_durable = op_time;
            true
        } else {
            false
        }
    }
}

/// Maps journal tokens back to the OpTime admitted with them.
///
/// Tokens and OpTimes are admitted in matching increasing order, so the
/// mapping is a queue.
#[derive(Debug, Default)]
pub struct TokenCorrelation {
    pending: VecDeque<(JournalToken, OpTime)>,
    durable_token: JournalToken,
}

impl TokenCorrelation {
    /// Record an admission. Returns the OpTime at once when its token is
    /// already durable.
    pub fn admitted(&mut self, token: JournalToken, op_time: OpTime) -> Option<OpTime> {
        if token <= self.durable_token {
            return Some(op_time);
        }
        self.pending.push_back((token, op_time));
        None
    }

    /// Every token `<= token` is durable; returns the newest OpTime covered
    pub fn durable(&mut self, token: JournalToken) -> Option<OpTime> {
        if token > self.durable_token {
            self.durable_token = token;
        }
        let mut newest = None;
        while let Some((t, op_time)) = self.pending.front().copied() {
            if t > token {
                break;
            }
            self.pending.pop_front();
            newest = Some(op_time);
        }
        newest
    }

    /// Forget pending admissions; the durable token is kept since tokens
    /// never go backwards.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn durable_token(&self) -> JournalToken {
        self.durable_token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(i: u32) -> OpTime {
        OpTime::new(i, 0, 1)
    }

    #[test]
    fn test_durable_pops_covered_tokens() {
        let mut c = TokenCorrelation::default();
        assert_eq!(c.admitted(JournalToken(1), t(10)), None);
        assert_eq!(c.admitted(JournalToken(2), t(20)), None);
        assert_eq!(c.admitted(JournalToken(3), t(30)), None);

        assert_eq!(c.durable(JournalToken(2)), Some(t(20)));
        assert_eq!(c.pending(), 1);
        assert_eq!(c.durable(JournalToken(2)), None);
        assert_eq!(c.durable(JournalToken(3)), Some(t(30)));
    }

    #[test]
    fn test_admission_after_durability() {
        let mut c = TokenCorrelation::default();
        c.durable(JournalToken(5));
        assert_eq!(c.admitted(JournalToken(4), t(40)), Some(t(40)));
        assert_eq!(c.admitted(JournalToken(6), t(60)), None);
    }

    #[test]
    fn test_watermarks_never_regress() {
        let mut w = Watermarks::default();
        assert!(w.advance_applied(t(2)));
        assert!(!w.advance_applied(t(1)));
        assert_eq!(w.last_applied, t(2));
        assert!(w.advance_durable(t(1)));
        assert!(!w.advance_durable(OpTime::null()));
    }
}
