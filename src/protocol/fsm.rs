// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Confirmation state machine.
//!
//! A pure reducer: [`Machine::reduce`] maps `(machine, event)` to a new machine
//! plus the list of [`Effect`]s the controller must carry out. Nothing here
//! touches the clock, the ledger or the network, so every transition rule can be
//! exercised directly.
//!
//! Timer events carry the epoch (per-step timer) or session (ceiling) they were
//! armed for. A timer that fires after the machine has already moved on no
//! longer matches and reduces to a no-op: the first valid transition wins.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::ProtocolError;
use crate::core::incident::{actions, IncidentStatus, LogOutcome, StepType};

/// Where the protocol currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolState {
    Idle,
    Initial,
    LocationConfirm,
    ContactsConfirm,
    FinalConfirm,
    Executing,
    Completed,
    Cancelled,
    Error,
}

impl ProtocolState {
    /// The step a `confirm` must name to be accepted here.
    pub fn expected_step(&self) -> Option<StepType> {
        match self {
            ProtocolState::Initial => Some(StepType::Initial),
            ProtocolState::LocationConfirm => Some(StepType::Location),
            ProtocolState::ContactsConfirm => Some(StepType::Contacts),
            ProtocolState::FinalConfirm => Some(StepType::Final),
            _ => None,
        }
    }

    fn after_confirm(&self) -> Option<ProtocolState> {
        match self {
            ProtocolState::Initial => Some(ProtocolState::LocationConfirm),
            ProtocolState::LocationConfirm => Some(ProtocolState::ContactsConfirm),
            ProtocolState::ContactsConfirm => Some(ProtocolState::FinalConfirm),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProtocolState::Completed | ProtocolState::Cancelled | ProtocolState::Error
        )
    }

    /// An incident is in flight: activated and not yet resolved.
    pub fn is_active(&self) -> bool {
        !matches!(self, ProtocolState::Idle) && !self.is_terminal()
    }
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolState::Idle => "Idle",
            ProtocolState::Initial => "Initial",
            ProtocolState::LocationConfirm => "LocationConfirm",
            ProtocolState::ContactsConfirm => "ContactsConfirm",
            ProtocolState::FinalConfirm => "FinalConfirm",
            ProtocolState::Executing => "Executing",
            ProtocolState::Completed => "Completed",
            ProtocolState::Cancelled => "Cancelled",
            ProtocolState::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Why an incident ended up `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    User,
    /// The per-step countdown expired (`AUTO_CANCEL`).
    AutoCancelExpired,
    /// The session ceiling expired before execution began (`AUTO_CANCEL`).
    SessionCeiling,
}

/// Inputs to the reducer. User actions, timer expiries and dispatcher results
/// are all normalised into this one type.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    Activate,
    Confirm(StepType),
    StepTimeout { epoch: u64 },
    SessionExpired { session: u64 },
    Cancel,
    Execute,
    DispatchResolved { delivered: bool },
}

/// Side effects requested by a transition, applied in order by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    RecordStep(StepType),
    SetStatus(IncidentStatus),
    Log {
        action: &'static str,
        outcome: LogOutcome,
        message: String,
        data: Option<Value>,
    },
    StartSession { session: u64 },
    ArmStepTimer { epoch: u64 },
    DisarmStepTimer,
    StopTimers,
    BeginDispatch,
}

impl Effect {
    fn log(action: &'static str, outcome: LogOutcome, message: impl Into<String>) -> Self {
        Effect::Log {
            action,
            outcome,
            message: message.into(),
            data: None,
        }
    }
}

/// Snapshot of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Machine {
    pub state: ProtocolState,
    /// One-way: cleared on entering `Executing` or any terminal state.
    pub cancellable: bool,
    /// The final step has been confirmed; the step countdown no longer applies.
    pub final_confirmed: bool,
    /// Incremented on every state entry. Step timers are tagged with it.
    pub epoch: u64,
    /// Incremented on every activation. Session ceilings are tagged with it.
    pub session: u64,
    pub cancel_reason: Option<CancelReason>,
}

/// Result of a successful reduction.
#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    pub machine: Machine,
    pub effects: Vec<Effect>,
}

impl Reduction {
    fn unchanged(machine: Machine) -> Self {
        Self {
            machine,
            effects: Vec::new(),
        }
    }

    /// The event was absorbed without any transition or side effect.
    pub fn is_noop(&self) -> bool {
        self.effects.is_empty()
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn new() -> Self {
        Self {
            state: ProtocolState::Idle,
            cancellable: true,
            final_confirmed: false,
            epoch: 0,
            session: 0,
            cancel_reason: None,
        }
    }

    fn enter(&self, state: ProtocolState) -> Machine {
        Machine {
            state,
            epoch: self.epoch + 1,
            ..*self
        }
    }

    fn accepts_timeout(&self) -> bool {
        match self.state {
            ProtocolState::Initial | ProtocolState::LocationConfirm | ProtocolState::ContactsConfirm => true,
            ProtocolState::FinalConfirm => !self.final_confirmed,
            _ => false,
        }
    }

    fn mismatch(&self, attempted: impl Into<String>) -> ProtocolError {
        ProtocolError::StateMismatch {
            state: self.state,
            attempted: attempted.into(),
        }
    }

    fn cancelled(&self, reason: CancelReason) -> Machine {
        Machine {
            cancellable: false,
            cancel_reason: Some(reason),
            ..self.enter(ProtocolState::Cancelled)
        }
    }

    /// Apply one event. Errors leave the machine exactly as it was.
    pub fn reduce(&self, event: &ProtocolEvent) -> Result<Reduction, ProtocolError> {
        match event {
            ProtocolEvent::Activate => {
                if self.state.is_active() {
                    return Ok(Reduction::unchanged(*self));
                }
                let machine = Machine {
                    state: ProtocolState::Initial,
                    cancellable: true,
                    final_confirmed: false,
                    epoch: self.epoch + 1,
                    session: self.session + 1,
                    cancel_reason: None,
                };
                Ok(Reduction {
                    machine,
                    effects: vec![
                        Effect::log(
                            actions::SOS_ACTIVATED,
                            LogOutcome::Success,
                            "SOS triggered, starting guarded confirmation protocol",
                        ),
                        Effect::StartSession {
                            session: machine.session,
                        },
                        Effect::ArmStepTimer {
                            epoch: machine.epoch,
                        },
                    ],
                })
            }

            ProtocolEvent::Confirm(step) => {
                if self.state.expected_step() != Some(*step) {
                    return Err(self.mismatch(format!("confirm({})", step)));
                }
                let message = format!("step {} ({}) confirmed", step.index(), step);

                if self.state == ProtocolState::FinalConfirm {
                    if self.final_confirmed {
                        return Err(self.mismatch(format!("confirm({})", step)));
                    }
                    let machine = Machine {
                        final_confirmed: true,
                        ..*self
                    };
                    return Ok(Reduction {
                        machine,
                        effects: vec![
                            Effect::RecordStep(*step),
                            Effect::SetStatus(IncidentStatus::Confirmed),
                            Effect::log(actions::STEP_CONFIRMED, LogOutcome::Success, message),
                            Effect::DisarmStepTimer,
                        ],
                    });
                }

                let next = match self.state.after_confirm() {
                    Some(next) => next,
                    None => return Err(self.mismatch(format!("confirm({})", step))),
                };
                let machine = self.enter(next);
                Ok(Reduction {
                    machine,
                    effects: vec![
                        Effect::RecordStep(*step),
                        Effect::log(actions::STEP_CONFIRMED, LogOutcome::Success, message),
                        Effect::ArmStepTimer {
                            epoch: machine.epoch,
                        },
                    ],
                })
            }

            ProtocolEvent::StepTimeout { epoch } => {
                if *epoch != self.epoch || !self.accepts_timeout() {
                    return Ok(Reduction::unchanged(*self));
                }
                Ok(Reduction {
                    machine: self.cancelled(CancelReason::AutoCancelExpired),
                    effects: vec![
                        Effect::SetStatus(IncidentStatus::Cancelled),
                        Effect::Log {
                            action: actions::AUTO_CANCEL,
                            outcome: LogOutcome::Warning,
                            message: "cancelled automatically: no confirmation before the step timeout"
                                .to_string(),
                            data: Some(json!({ "trigger": "step_timeout", "state": self.state })),
                        },
                        Effect::StopTimers,
                    ],
                })
            }

            ProtocolEvent::SessionExpired { session } => {
                if *session != self.session {
                    return Ok(Reduction::unchanged(*self));
                }
                match self.state {
                    ProtocolState::Executing => Ok(Reduction {
                        machine: *self,
                        effects: vec![Effect::log(
                            actions::SESSION_CEILING_ADVISORY,
                            LogOutcome::Warning,
                            "session ceiling reached while executing; execution is irrevocable and continues",
                        )],
                    }),
                    state if state.is_active() && self.cancellable => Ok(Reduction {
                        machine: self.cancelled(CancelReason::SessionCeiling),
                        effects: vec![
                            Effect::SetStatus(IncidentStatus::Cancelled),
                            Effect::Log {
                                action: actions::AUTO_CANCEL,
                                outcome: LogOutcome::Warning,
                                message: "cancelled automatically: session ceiling reached".to_string(),
                                data: Some(json!({ "trigger": "session_ceiling", "state": state })),
                            },
                            Effect::StopTimers,
                        ],
                    }),
                    _ => Ok(Reduction::unchanged(*self)),
                }
            }

            ProtocolEvent::Cancel => {
                if self.state == ProtocolState::Idle {
                    return Err(ProtocolError::NoActiveIncident);
                }
                if !self.cancellable {
                    return Err(ProtocolError::NotCancellable { state: self.state });
                }
                Ok(Reduction {
                    machine: self.cancelled(CancelReason::User),
                    effects: vec![
                        Effect::SetStatus(IncidentStatus::Cancelled),
                        Effect::log(actions::USER_CANCEL, LogOutcome::Warning, "cancelled by the user"),
                        Effect::StopTimers,
                    ],
                })
            }

            ProtocolEvent::Execute => {
                if self.state != ProtocolState::FinalConfirm {
                    return Err(self.mismatch("execute_final"));
                }
                let mut effects = Vec::new();
                if !self.final_confirmed {
                    effects.push(Effect::RecordStep(StepType::Final));
                    effects.push(Effect::SetStatus(IncidentStatus::Confirmed));
                }
                effects.push(Effect::DisarmStepTimer);
                effects.push(Effect::log(
                    actions::EXECUTION_START,
                    LogOutcome::Success,
                    "executing emergency protocol; cancellation is no longer possible",
                ));
                effects.push(Effect::BeginDispatch);

                let machine = Machine {
                    cancellable: false,
                    final_confirmed: true,
                    ..self.enter(ProtocolState::Executing)
                };
                Ok(Reduction { machine, effects })
            }

            ProtocolEvent::DispatchResolved { delivered } => {
                if self.state != ProtocolState::Executing {
                    return Err(self.mismatch("dispatch result"));
                }
                if *delivered {
                    Ok(Reduction {
                        machine: self.enter(ProtocolState::Completed),
                        effects: vec![
                            Effect::SetStatus(IncidentStatus::Executed),
                            Effect::log(
                                actions::EXECUTION_COMPLETE,
                                LogOutcome::Success,
                                "emergency protocol executed",
                            ),
                            Effect::StopTimers,
                        ],
                    })
                } else {
                    Ok(Reduction {
                        machine: self.enter(ProtocolState::Error),
                        effects: vec![
                            Effect::log(
                                actions::EXECUTION_ERROR,
                                LogOutcome::Error,
                                "emergency protocol could not deliver or queue the incident",
                            ),
                            Effect::StopTimers,
                        ],
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STEPS: [StepType; 4] = [
        StepType::Initial,
        StepType::Location,
        StepType::Contacts,
        StepType::Final,
    ];

    fn apply(machine: Machine, event: ProtocolEvent) -> Machine {
        machine.reduce(&event).expect("transition should be accepted").machine
    }

    fn at_final() -> Machine {
        let mut m = apply(Machine::new(), ProtocolEvent::Activate);
        m = apply(m, ProtocolEvent::Confirm(StepType::Initial));
        m = apply(m, ProtocolEvent::Confirm(StepType::Location));
        apply(m, ProtocolEvent::Confirm(StepType::Contacts))
    }

    fn log_actions(effects: &[Effect]) -> Vec<&'static str> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Log { action, .. } => Some(*action),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_activate_enters_initial_and_arms_timers() {
        let r = Machine::new().reduce(&ProtocolEvent::Activate).unwrap();
        assert_eq!(r.machine.state, ProtocolState::Initial);
        assert!(r.machine.cancellable);
        assert_eq!(r.machine.session, 1);
        assert!(r.effects.contains(&Effect::StartSession { session: 1 }));
        assert!(r.effects.contains(&Effect::ArmStepTimer { epoch: r.machine.epoch }));
    }

    #[test]
    fn test_activate_while_active_is_noop() {
        let m = apply(Machine::new(), ProtocolEvent::Activate);
        let r = m.reduce(&ProtocolEvent::Activate).unwrap();
        assert!(r.is_noop());
        assert_eq!(r.machine, m);
    }

    #[test]
    fn test_only_matching_confirm_is_accepted() {
        // Walk the happy path and, at every state, try every step type.
        let mut m = apply(Machine::new(), ProtocolEvent::Activate);
        for expected in ALL_STEPS {
            for step in ALL_STEPS {
                if step == expected {
                    continue;
                }
                let err = m.reduce(&ProtocolEvent::Confirm(step)).unwrap_err();
                assert!(
                    matches!(err, ProtocolError::StateMismatch { state, .. } if state == m.state),
                    "confirm({}) in {} should mismatch, got {:?}",
                    step,
                    m.state,
                    err
                );
            }
            let r = m.reduce(&ProtocolEvent::Confirm(expected)).unwrap();
            assert_eq!(r.effects[0], Effect::RecordStep(expected));
            m = r.machine;
        }
        assert_eq!(m.state, ProtocolState::FinalConfirm);
        assert!(m.final_confirmed);
    }

    #[test]
    fn test_confirm_rejected_outside_confirmation_states() {
        for state in [
            ProtocolState::Idle,
            ProtocolState::Executing,
            ProtocolState::Completed,
            ProtocolState::Cancelled,
            ProtocolState::Error,
        ] {
            let m = Machine { state, ..Machine::new() };
            for step in ALL_STEPS {
                assert!(m.reduce(&ProtocolEvent::Confirm(step)).is_err());
            }
        }
    }

    #[test]
    fn test_final_confirm_twice_is_mismatch() {
        let m = apply(at_final(), ProtocolEvent::Confirm(StepType::Final));
        let err = m.reduce(&ProtocolEvent::Confirm(StepType::Final)).unwrap_err();
        assert!(matches!(err, ProtocolError::StateMismatch { .. }));
    }

    #[test]
    fn test_timeout_cancels_with_auto_cancel() {
        let m = apply(apply(Machine::new(), ProtocolEvent::Activate), ProtocolEvent::Confirm(StepType::Initial));
        assert_eq!(m.state, ProtocolState::LocationConfirm);

        let r = m.reduce(&ProtocolEvent::StepTimeout { epoch: m.epoch }).unwrap();
        assert_eq!(r.machine.state, ProtocolState::Cancelled);
        assert_eq!(r.machine.cancel_reason, Some(CancelReason::AutoCancelExpired));
        assert!(!r.machine.cancellable);
        assert_eq!(log_actions(&r.effects), vec![actions::AUTO_CANCEL]);
        assert!(r.effects.contains(&Effect::SetStatus(IncidentStatus::Cancelled)));
    }

    #[test]
    fn test_stale_timeout_is_noop() {
        let activated = apply(Machine::new(), ProtocolEvent::Activate);
        let stale_epoch = activated.epoch;
        let advanced = apply(activated, ProtocolEvent::Confirm(StepType::Initial));

        let r = advanced.reduce(&ProtocolEvent::StepTimeout { epoch: stale_epoch }).unwrap();
        assert!(r.is_noop());
        assert_eq!(r.machine.state, ProtocolState::LocationConfirm);
    }

    #[test]
    fn test_timeout_after_cancel_is_noop() {
        let m = apply(apply(Machine::new(), ProtocolEvent::Activate), ProtocolEvent::Cancel);
        let r = m.reduce(&ProtocolEvent::StepTimeout { epoch: m.epoch }).unwrap();
        assert!(r.is_noop());
        assert_eq!(r.machine.state, ProtocolState::Cancelled);
    }

    #[test]
    fn test_timeout_at_final_before_and_after_confirmation() {
        let m = at_final();
        let r = m.reduce(&ProtocolEvent::StepTimeout { epoch: m.epoch }).unwrap();
        assert_eq!(r.machine.state, ProtocolState::Cancelled);

        let confirmed = apply(m, ProtocolEvent::Confirm(StepType::Final));
        let r = confirmed
            .reduce(&ProtocolEvent::StepTimeout { epoch: confirmed.epoch })
            .unwrap();
        assert!(r.is_noop());
        assert_eq!(r.machine.state, ProtocolState::FinalConfirm);
    }

    #[test]
    fn test_execute_only_from_final() {
        let m = apply(Machine::new(), ProtocolEvent::Activate);
        let err = m.reduce(&ProtocolEvent::Execute).unwrap_err();
        assert!(matches!(err, ProtocolError::StateMismatch { .. }));

        let r = at_final().reduce(&ProtocolEvent::Execute).unwrap();
        assert_eq!(r.machine.state, ProtocolState::Executing);
        assert!(!r.machine.cancellable);
        // Final step recorded implicitly when not confirmed beforehand.
        assert_eq!(r.effects[0], Effect::RecordStep(StepType::Final));
        assert_eq!(r.effects.last(), Some(&Effect::BeginDispatch));
    }

    #[test]
    fn test_execute_after_final_confirm_does_not_record_twice() {
        let m = apply(at_final(), ProtocolEvent::Confirm(StepType::Final));
        let r = m.reduce(&ProtocolEvent::Execute).unwrap();
        assert!(!r.effects.iter().any(|e| matches!(e, Effect::RecordStep(_))));
    }

    #[test]
    fn test_cancel_not_possible_once_executing() {
        let m = apply(at_final(), ProtocolEvent::Execute);
        for _ in 0..3 {
            let err = m.reduce(&ProtocolEvent::Cancel).unwrap_err();
            assert_eq!(err, ProtocolError::NotCancellable { state: ProtocolState::Executing });
        }
        let done = apply(m, ProtocolEvent::DispatchResolved { delivered: true });
        assert!(matches!(
            done.reduce(&ProtocolEvent::Cancel),
            Err(ProtocolError::NotCancellable { .. })
        ));
    }

    #[test]
    fn test_cancel_from_idle() {
        assert_eq!(
            Machine::new().reduce(&ProtocolEvent::Cancel).unwrap_err(),
            ProtocolError::NoActiveIncident
        );
    }

    #[test]
    fn test_session_ceiling_cancels_mid_step() {
        let m = apply(apply(Machine::new(), ProtocolEvent::Activate), ProtocolEvent::Confirm(StepType::Initial));
        let r = m.reduce(&ProtocolEvent::SessionExpired { session: m.session }).unwrap();
        assert_eq!(r.machine.state, ProtocolState::Cancelled);
        assert_eq!(r.machine.cancel_reason, Some(CancelReason::SessionCeiling));
        assert_eq!(log_actions(&r.effects), vec![actions::AUTO_CANCEL]);
    }

    #[test]
    fn test_session_ceiling_advisory_while_executing() {
        let m = apply(at_final(), ProtocolEvent::Execute);
        let r = m.reduce(&ProtocolEvent::SessionExpired { session: m.session }).unwrap();
        assert_eq!(r.machine, m);
        assert_eq!(log_actions(&r.effects), vec![actions::SESSION_CEILING_ADVISORY]);
    }

    #[test]
    fn test_session_from_previous_activation_is_ignored() {
        let first = apply(apply(Machine::new(), ProtocolEvent::Activate), ProtocolEvent::Cancel);
        let second = apply(first, ProtocolEvent::Activate);
        assert_eq!(second.session, first.session + 1);
        let r = second
            .reduce(&ProtocolEvent::SessionExpired { session: first.session })
            .unwrap();
        assert!(r.is_noop());
        assert_eq!(r.machine.state, ProtocolState::Initial);
    }

    #[test]
    fn test_dispatch_outcomes() {
        let executing = apply(at_final(), ProtocolEvent::Execute);

        let ok = executing.reduce(&ProtocolEvent::DispatchResolved { delivered: true }).unwrap();
        assert_eq!(ok.machine.state, ProtocolState::Completed);
        assert!(ok.effects.contains(&Effect::SetStatus(IncidentStatus::Executed)));

        let failed = executing.reduce(&ProtocolEvent::DispatchResolved { delivered: false }).unwrap();
        assert_eq!(failed.machine.state, ProtocolState::Error);
        assert_eq!(log_actions(&failed.effects), vec![actions::EXECUTION_ERROR]);
    }

    #[test]
    fn test_reactivation_after_terminal() {
        let done = apply(
            apply(at_final(), ProtocolEvent::Execute),
            ProtocolEvent::DispatchResolved { delivered: true },
        );
        let again = apply(done, ProtocolEvent::Activate);
        assert_eq!(again.state, ProtocolState::Initial);
        assert!(again.cancellable);
        assert!(!again.final_confirmed);
        assert_eq!(again.cancel_reason, None);
    }
}
