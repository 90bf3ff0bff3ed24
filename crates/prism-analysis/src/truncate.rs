//! Token-budget truncation for conversations handed to the analysis model.
//!
//! Strategy: keep everything when it fits; otherwise keep the first `head`
//! and last `tail` messages with a fixed placeholder between them, then
//! drop from the middle of the tail until the budget holds. Openings carry
//! intent and endings carry outcomes; the middle is the expendable part.

use tiktoken_rs::CoreBPE;

use crate::error::{AnalysisError, Result};
use prism_storage::types::BranchMessage;

pub const TRUNCATION_MARKER: &str = "[... middle messages truncated ...]";

pub struct Truncator {
    bpe: CoreBPE,
    budget: usize,
    head: usize,
    tail: usize,
}

impl Truncator {
    pub fn new(budget: usize, head: usize, tail: usize) -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| AnalysisError::Tokenizer(e.to_string()))?;
        Ok(Self {
            bpe,
            budget,
            head: head.max(1),
            tail: tail.max(1),
        })
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// Fit `messages` under the token budget. Returns the kept messages and
    /// their token count.
    pub fn truncate(&self, messages: Vec<BranchMessage>) -> (Vec<BranchMessage>, usize) {
        let counts: Vec<usize> = messages
            .iter()
            .map(|m| self.count_tokens(&m.role) + self.count_tokens(&m.text))
            .collect();
        let total: usize = counts.iter().sum();
        if total <= self.budget {
            return (messages, total);
        }

        let marker = BranchMessage {
            role: "system".to_string(),
            text: TRUNCATION_MARKER.to_string(),
        };
        let marker_tokens = self.count_tokens(&marker.role) + self.count_tokens(&marker.text);

        let head_end = self.head.min(messages.len());
        let tail_start = messages.len().saturating_sub(self.tail).max(head_end);

        let head: Vec<BranchMessage> = messages[..head_end].to_vec();
        let head_tokens: usize = counts[..head_end].iter().sum();
        let mut tail: Vec<BranchMessage> = messages[tail_start..].to_vec();
        let mut tail_counts: Vec<usize> = counts[tail_start..].to_vec();

        // Drop from the middle of the tail while over budget. The last
        // message always survives — it holds the outcome.
        loop {
            let tail_tokens: usize = tail_counts.iter().sum();
            let current = head_tokens + marker_tokens + tail_tokens;
            if current <= self.budget || tail.len() <= 1 {
                let mut kept = head;
                kept.push(marker);
                kept.extend(tail);
                return (kept, current);
            }
            let drop_at = tail.len() / 2;
            tail.remove(drop_at);
            tail_counts.remove(drop_at);
        }
    }
}
