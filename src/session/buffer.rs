use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::fusion::FusedInsight;
use crate::transport::{ContextPayload, ReplyPayload, TranscriptionPayload};

/// Outbound content waiting for the session to become active
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Insight(FusedInsight),
    Context(ContextPayload),
    Audio { pcm: Vec<i16>, sample_rate: u32 },
}

impl Outbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Insight(_) => "insight",
            Outbound::Context(_) => "context",
            Outbound::Audio { .. } => "audio",
        }
    }
}

/// Inbound turn that arrived before the session became active
#[derive(Debug, Clone, PartialEq)]
pub enum InboundTurn {
    Transcription(TranscriptionPayload),
    Reply(ReplyPayload),
}

#[derive(Debug)]
struct Buffered<T> {
    cycle: u64,
    item: T,
}

/// Bounded FIFOs of outbound content and inbound turns, stamped with the
/// setup cycle they arrived in
///
/// Holds at most one pose context (the latest). When full, the oldest entry
/// is dropped.
#[derive(Debug)]
pub struct PendingBuffer {
    items: VecDeque<Buffered<Outbound>>,
    turns: VecDeque<Buffered<InboundTurn>>,
    limit: usize,
    cycle: u64,
}

impl PendingBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            items: VecDeque::new(),
            turns: VecDeque::new(),
            limit: limit.max(1),
            cycle: 0,
        }
    }

    /// Start a new setup cycle, dropping everything stamped with an older one
    pub fn begin_cycle(&mut self, cycle: u64) {
        self.cycle = cycle;

        let before = self.items.len() + self.turns.len();
        self.items.retain(|b| b.cycle >= cycle);
        self.turns.retain(|b| b.cycle >= cycle);
        let dropped = before - self.items.len() - self.turns.len();
        if dropped > 0 {
            warn!("Dropped {} buffered messages from an earlier setup cycle", dropped);
        }
    }

    pub fn push(&mut self, item: Outbound) {
        if matches!(item, Outbound::Context(_)) {
            self.items.retain(|b| !matches!(b.item, Outbound::Context(_)));
        }

        if self.items.len() >= self.limit {
            if let Some(oldest) = self.items.pop_front() {
                debug!("Session buffer full, dropped oldest {}", oldest.item.kind());
            }
        }

        self.items.push_back(Buffered {
            cycle: self.cycle,
            item,
        });
    }

    pub fn push_turn(&mut self, turn: InboundTurn) {
        if self.turns.len() >= self.limit {
            self.turns.pop_front();
            debug!("Session buffer full, dropped oldest inbound turn");
        }
        self.turns.push_back(Buffered {
            cycle: self.cycle,
            item: turn,
        });
    }

    /// Put unsent content back at the front, kept for the next setup cycle
    pub fn carry_over(&mut self, unsent: Vec<Outbound>) {
        let cycle = self.cycle + 1;
        for item in unsent.into_iter().rev() {
            if self.items.len() >= self.limit {
                break;
            }
            self.items.push_front(Buffered { cycle, item });
        }
    }

    /// Take buffered content for the current cycle, in arrival order
    pub fn drain(&mut self) -> Vec<Outbound> {
        take_cycle(&mut self.items, self.cycle)
    }

    pub fn drain_turns(&mut self) -> Vec<InboundTurn> {
        take_cycle(&mut self.turns, self.cycle)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.turns.clear();
    }

    /// Buffered outbound messages
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.turns.is_empty()
    }
}

fn take_cycle<T>(queue: &mut VecDeque<Buffered<T>>, cycle: u64) -> Vec<T> {
    queue
        .drain(..)
        .filter(|b| b.cycle == cycle)
        .map(|b| b.item)
        .collect()
}
