// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

//! The single progress/cancellation channel threaded through every pipeline
//! step. A [`Reporter`] is the producing end: it owns the sender half of an
//! [`mpsc`] channel of [`Event`]s and the shared cancel signal. Exactly one
//! consumer (the UI) drains the receiver.

use std::{
    cell::Cell,
    io,
    sync::{
        Arc,
        atomic::AtomicBool,
        mpsc::{self, Receiver, Sender},
    },
};

use tracing::{info, warn};

use crate::stream;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A new step started.
    Step(String),
    /// Progress of the current step. `percent` is meaningless when
    /// `indeterminate` is set.
    Progress { percent: u8, indeterminate: bool },
    /// Something unexpected that does not stop the run.
    Warning(String),
}

pub struct Reporter {
    sender: Option<Sender<Event>>,
    cancel_signal: Arc<AtomicBool>,
    last_percent: Cell<Option<u8>>,
}

impl Reporter {
    /// Create a reporter and the receiving end of its event channel.
    pub fn channel(cancel_signal: Arc<AtomicBool>) -> (Self, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        let reporter = Self {
            sender: Some(tx),
            cancel_signal,
            last_percent: Cell::new(None),
        };

        (reporter, rx)
    }

    /// Create a reporter that discards all events. Only cancellation works.
    pub fn silent(cancel_signal: Arc<AtomicBool>) -> Self {
        Self {
            sender: None,
            cancel_signal,
            last_percent: Cell::new(None),
        }
    }

    /// A reporter on the same channel whose cancel signal is never raised.
    /// Rollbacks run through it so that they finish after a cancellation.
    pub fn detached(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            cancel_signal: Arc::new(AtomicBool::new(false)),
            last_percent: Cell::new(None),
        }
    }

    pub fn cancel_signal(&self) -> &AtomicBool {
        &self.cancel_signal
    }

    #[inline]
    pub fn check_cancel(&self) -> io::Result<()> {
        stream::check_cancel(&self.cancel_signal)
    }

    fn send(&self, event: Event) {
        if let Some(tx) = &self.sender {
            // The consumer going away is not our problem.
            let _ = tx.send(event);
        }
    }

    pub fn step(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{message}");

        self.last_percent.set(None);
        self.send(Event::Step(message));
    }

    pub fn warning(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");

        self.send(Event::Warning(message));
    }

    /// Report `current` out of `total` units. Without a known total, the
    /// progress is reported as indeterminate. Events are only sent when the
    /// integer percentage changes.
    pub fn progress(&self, current: u64, total: Option<u64>) {
        match total {
            Some(t) if t > 0 => {
                let percent = (current.min(t) * 100 / t) as u8;
                if self.last_percent.get() != Some(percent) {
                    self.last_percent.set(Some(percent));
                    self.send(Event::Progress {
                        percent,
                        indeterminate: false,
                    });
                }
            }
            _ => self.indeterminate(),
        }
    }

    pub fn indeterminate(&self) {
        if self.last_percent.get() != Some(u8::MAX) {
            self.last_percent.set(Some(u8::MAX));
            self.send(Event::Progress {
                percent: 0,
                indeterminate: true,
            });
        }
    }
}
