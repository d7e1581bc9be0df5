// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The interface between a running build and its operator.

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError},
    time::Duration,
};

use crate::orchestrator::{Phase, PhaseOutcome};

/// Progress reporting and operator interaction for a build.
pub trait Ui {
    fn phase_started(&self, phase: Phase);

    fn phase_finished(&self, phase: Phase, outcome: PhaseOutcome);

    /// Describes what the current phase is doing right now.
    fn set_substep(&self, substep: &str);

    /// Asks the operator a yes/no question. `default` is the answer given by
    /// just pressing Enter; with nobody at the console the answer is `false`.
    fn confirm(&self, question: &str, default: bool) -> bool;

    /// Returns a signal that fires when the operator says the current phase's
    /// in-guest work is complete.
    fn acknowledgment(&self, prompt: &str) -> Acknowledgment<'_>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckStatus {
    Pending,
    Acknowledged,

    /// Nothing can ever acknowledge this signal (e.g. the operator's input
    /// stream closed).
    Cancelled,
}

/// A cancellable "phase acknowledged complete" signal.
///
/// The console supplies one of these from the operator's keyboard, but
/// anything that can answer [`AckStatus`] within a timeout can drive it.
pub struct Acknowledgment<'a> {
    poll: Box<dyn Fn(Duration) -> AckStatus + 'a>,
}

impl<'a> Acknowledgment<'a> {
    pub fn from_fn(poll: impl Fn(Duration) -> AckStatus + 'a) -> Self {
        Self { poll: Box::new(poll) }
    }

    /// A signal that never fires; waits on it only end when the guest exits.
    pub fn never() -> Self {
        Self::from_fn(|timeout| {
            std::thread::sleep(timeout);
            AckStatus::Pending
        })
    }

    /// A signal that fires on any message received on `rx`. Disconnecting
    /// every sender cancels it.
    pub fn from_receiver<T>(rx: &'a Receiver<T>) -> Self {
        Self::from_fn(move |timeout| match rx.recv_timeout(timeout) {
            Ok(_) => AckStatus::Acknowledged,
            Err(RecvTimeoutError::Timeout) => AckStatus::Pending,
            Err(RecvTimeoutError::Disconnected) => AckStatus::Cancelled,
        })
    }

    /// Waits up to `timeout` for the signal.
    pub fn wait_timeout(&self, timeout: Duration) -> AckStatus {
        (self.poll)(timeout)
    }
}

#[cfg(test)]
impl Acknowledgment<'static> {
    pub fn acknowledged() -> Self {
        Self::from_fn(|_| AckStatus::Acknowledged)
    }

    pub fn cancelled() -> Self {
        Self::from_fn(|_| AckStatus::Cancelled)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{cell::RefCell, collections::VecDeque};

    use super::*;

    /// A `Ui` that answers questions from a script and records what the
    /// build told it.
    #[derive(Default)]
    pub struct ScriptedUi {
        answers: RefCell<VecDeque<bool>>,
        pub questions: RefCell<Vec<String>>,
        pub started: RefCell<Vec<Phase>>,
        pub finished: RefCell<Vec<(Phase, PhaseOutcome)>>,

        /// When set, interactive phases are acknowledged immediately;
        /// otherwise the guest has to exit on its own.
        pub acknowledge: bool,
    }

    impl ScriptedUi {
        pub fn acknowledging() -> Self {
            Self { acknowledge: true, ..Default::default() }
        }

        pub fn answering(self, answers: &[bool]) -> Self {
            self.answers.borrow_mut().extend(answers.iter().copied());
            self
        }
    }

    impl Ui for ScriptedUi {
        fn phase_started(&self, phase: Phase) {
            self.started.borrow_mut().push(phase);
        }

        fn phase_finished(&self, phase: Phase, outcome: PhaseOutcome) {
            self.finished.borrow_mut().push((phase, outcome));
        }

        fn set_substep(&self, _substep: &str) {}

        fn confirm(&self, question: &str, default: bool) -> bool {
            self.questions.borrow_mut().push(question.to_string());
            self.answers.borrow_mut().pop_front().unwrap_or(default)
        }

        fn acknowledgment(&self, _prompt: &str) -> Acknowledgment<'_> {
            if self.acknowledge {
                Acknowledgment::acknowledged()
            } else {
                Acknowledgment::never()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn channel_acknowledgment() {
        let (tx, rx) = std::sync::mpsc::channel();
        let ack = Acknowledgment::from_receiver(&rx);
        assert_eq!(
            ack.wait_timeout(Duration::from_millis(1)),
            AckStatus::Pending
        );
        tx.send(()).unwrap();
        assert_eq!(
            ack.wait_timeout(Duration::from_millis(1)),
            AckStatus::Acknowledged
        );
        drop(tx);
        assert_eq!(
            ack.wait_timeout(Duration::from_millis(1)),
            AckStatus::Cancelled
        );
    }

    #[test]
    fn never_stays_pending() {
        let ack = Acknowledgment::never();
        assert_eq!(
            ack.wait_timeout(Duration::from_millis(1)),
            AckStatus::Pending
        );
    }
}
