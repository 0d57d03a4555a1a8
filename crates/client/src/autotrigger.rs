// Auto-trigger scheduler: decides when to issue an AI command on its own.
//
// Every local edit reschedules a single debounce timer. When it expires the
// trigger predicate is evaluated against the current content; a pass fires
// once and starts the cooldown. A 1-second countdown runs alongside the
// debounce timer purely for display; `next_deadline` includes its ticks.
//
// Like the other state machines here, time is explicit: callers pass `now`
// and drive `poll_at` at `next_deadline`.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_DEBOUNCE_MS: u64 = 3_000;
pub const DEFAULT_COOLDOWN_MS: u64 = 30_000;
pub const DEFAULT_MIN_CHARACTERS: usize = 10;
pub const DEFAULT_MIN_CHANGE: usize = 20;

const COUNTDOWN_TICK: Duration = Duration::from_secs(1);
const SENTENCE_ENDINGS: [char; 7] = ['.', '!', '?', '。', '！', '？', '\n'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoTriggerConfig {
    pub enabled: bool,
    pub debounce: Duration,
    pub cooldown: Duration,
    /// Content shorter than this (in chars) never fires.
    pub min_characters: usize,
    /// After the first fire, the length must have moved by at least this
    /// much since the last fired snapshot, unless a sentence just ended.
    pub min_change: usize,
}

impl Default for AutoTriggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            cooldown: Duration::from_millis(DEFAULT_COOLDOWN_MS),
            min_characters: DEFAULT_MIN_CHARACTERS,
            min_change: DEFAULT_MIN_CHANGE,
        }
    }
}

/// Why an expired debounce did not fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Cooldown,
    TooShort,
    ChangeTooSmall,
}

/// Emitted when the predicate passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerFire {
    pub content: String,
    pub length: usize,
    pub first: bool,
}

#[derive(Debug)]
struct Pending {
    fires_at: Instant,
    next_tick: Instant,
    scheduled_length: usize,
}

#[derive(Debug)]
struct LastFire {
    at: Instant,
    length: usize,
    snapshot: String,
}

pub struct AutoTriggerScheduler {
    config: AutoTriggerConfig,
    document_active: bool,
    torn_down: bool,
    pending: Option<Pending>,
    last_fire: Option<LastFire>,
}

impl AutoTriggerScheduler {
    pub fn new(config: AutoTriggerConfig) -> Self {
        Self {
            config,
            document_active: false,
            torn_down: false,
            pending: None,
            last_fire: None,
        }
    }

    pub fn config(&self) -> &AutoTriggerConfig {
        &self.config
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
        if !enabled {
            self.cancel();
        }
    }

    /// Scheduling is a no-op until a document is active (hydrated).
    pub fn set_document_active(&mut self, active: bool) {
        self.document_active = active;
        if !active {
            self.cancel();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Whole seconds until the pending debounce expires, rounded up.
    pub fn seconds_remaining_at(&self, now: Instant) -> Option<u64> {
        self.pending.as_ref().map(|pending| ceil_secs(pending.fires_at.saturating_duration_since(now)))
    }

    /// Content captured by the most recent fire.
    pub fn last_fired_snapshot(&self) -> Option<&str> {
        self.last_fire.as_ref().map(|last| last.snapshot.as_str())
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|pending| pending.next_tick.min(pending.fires_at))
    }

    /// (Re)start the debounce for `content`. Returns whether a timer is now
    /// pending.
    pub fn schedule_at(&mut self, now: Instant, content: &str) -> bool {
        if self.torn_down || !self.config.enabled || !self.document_active {
            return false;
        }
        self.pending = Some(Pending {
            fires_at: now + self.config.debounce,
            next_tick: now + COUNTDOWN_TICK,
            scheduled_length: content.chars().count(),
        });
        true
    }

    /// Advance timers. Returns a fire when the debounce expired and the
    /// predicate passed for `current`.
    pub fn poll_at(&mut self, now: Instant, current: &str) -> Option<TriggerFire> {
        let pending = self.pending.as_mut()?;

        if pending.fires_at > now {
            while pending.next_tick <= now {
                pending.next_tick += COUNTDOWN_TICK;
            }
            return None;
        }

        let scheduled_length = pending.scheduled_length;
        self.pending = None;

        match self.evaluate_at(now, current) {
            Ok(()) => {
                let length = current.chars().count();
                let first = self.last_fire.is_none();
                self.last_fire = Some(LastFire { at: now, length, snapshot: current.to_string() });
                debug!(length, first, "auto-trigger fired");
                Some(TriggerFire { content: current.to_string(), length, first })
            }
            Err(reason) => {
                debug!(?reason, scheduled_length, "auto-trigger skipped");
                None
            }
        }
    }

    /// The trigger predicate, without side effects.
    pub fn evaluate_at(&self, now: Instant, content: &str) -> Result<(), SkipReason> {
        if let Some(last) = &self.last_fire {
            if now.saturating_duration_since(last.at) < self.config.cooldown {
                return Err(SkipReason::Cooldown);
            }
        }

        let length = content.chars().count();
        if length < self.config.min_characters {
            return Err(SkipReason::TooShort);
        }

        if let Some(last) = &self.last_fire {
            if length.abs_diff(last.length) < self.config.min_change && !ends_sentence(content) {
                return Err(SkipReason::ChangeTooSmall);
            }
        }
        Ok(())
    }

    /// Drop any pending timer. Safe from idle.
    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn teardown(&mut self) {
        self.torn_down = true;
        self.document_active = false;
        self.pending = None;
    }
}

/// Whether the content, ignoring trailing spaces and tabs, ends a sentence.
pub fn ends_sentence(content: &str) -> bool {
    content.trim_end_matches([' ', '\t']).ends_with(SENTENCE_ENDINGS)
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
