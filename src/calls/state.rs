//! Call state machine implementation.

use std::fmt;

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CallStateName {
    /// No negotiation has started yet.
    #[default]
    Idle,
    /// Gathering what the call needs before approval can begin.
    Preparing,
    /// Waiting on device (camera/microphone/screen) access approval.
    ApprovingDeviceAccess,
    /// Waiting on content approval (the second approval step).
    ApprovingContent,
    /// Local description emitted, waiting for the remote answer.
    Offering,
    /// Descriptions exchanged, waiting for remote media.
    Connecting,
    /// Media flowing in both directions.
    Connected,
    /// Renegotiation requested by this side, waiting on the remote.
    Modifying,
    /// Terminal state. No event leaves it.
    Terminated,
}

impl CallStateName {
    /// Wire/event name of the state, as it appears in `<state>:entry` events.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::ApprovingDeviceAccess => "approvingDeviceAccess",
            Self::ApprovingContent => "approvingContent",
            Self::Offering => "offering",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Modifying => "modifying",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for CallStateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events the call state machine reacts to.
///
/// Anything dispatched outside the transition table is silently ignored:
/// the state is left unchanged and no hook fires. Invalid events are never
/// errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    /// Start negotiating. `client_listening` reports whether the owning
    /// client has an incoming-call listener registered; without one the
    /// call goes straight to `Terminated`.
    Initiate { client_listening: bool },
    /// The local side accepts the call (callee answering, or a
    /// modify-initiated re-prepare).
    Answer,
    /// Approval granted. The first approve covers device access, the
    /// second covers content.
    Approve,
    /// Local media finished gathering.
    ReceiveLocalMedia,
    /// The local offer left through the signaling channel.
    SentOffer,
    /// The remote answer arrived.
    ReceiveAnswer,
    /// Remote media started flowing.
    ReceiveRemoteMedia,
    /// The remote side accepted our modify request.
    Accept,
    /// Renegotiate the call. `receive` is true when the remote initiated
    /// the modify and this side is re-preparing.
    Modify { receive: bool },
    /// Decline. While media is not yet flowing this tears the call down;
    /// once media flows it is a signaling-level reject of a losing fork
    /// and leaves the established call alone.
    Reject,
    /// Unconditional teardown.
    Hangup,
}

impl CallEvent {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initiate { .. } => "initiate",
            Self::Answer => "answer",
            Self::Approve => "approve",
            Self::ReceiveLocalMedia => "receiveLocalMedia",
            Self::SentOffer => "sentOffer",
            Self::ReceiveAnswer => "receiveAnswer",
            Self::ReceiveRemoteMedia => "receiveRemoteMedia",
            Self::Accept => "accept",
            Self::Modify { .. } => "modify",
            Self::Reject => "reject",
            Self::Hangup => "hangup",
        }
    }
}

/// A state change produced by [`CallFsm::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CallStateName,
    pub to: CallStateName,
    pub event: &'static str,
}

type StateHook = Box<dyn Fn(&Transition) + Send>;

#[derive(Default)]
struct Hooks {
    entry: Vec<(CallStateName, StateHook)>,
    exit: Vec<(CallStateName, StateHook)>,
    any: Vec<StateHook>,
}

/// Deterministic per-call finite-state machine.
///
/// Transitions are a total function over `(state, event)`: every pair not in
/// the table maps to the identity. On every state change the machine runs
/// `<prev>:exit` hooks, then `<next>:entry` hooks, then the catch-all
/// transition hooks, in registration order. Re-entering the current state
/// runs nothing.
pub struct CallFsm {
    state: CallStateName,
    caller: bool,
    has_media: bool,
    has_media_approval: bool,
    media_flowing: bool,
    modifying: bool,
    hooks: Hooks,
}

impl fmt::Debug for CallFsm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallFsm")
            .field("state", &self.state)
            .field("caller", &self.caller)
            .field("has_media", &self.has_media)
            .field("has_media_approval", &self.has_media_approval)
            .field("media_flowing", &self.media_flowing)
            .field("modifying", &self.modifying)
            .finish()
    }
}

impl CallFsm {
    pub fn new(caller: bool) -> Self {
        Self {
            state: CallStateName::Idle,
            caller,
            has_media: false,
            has_media_approval: false,
            media_flowing: false,
            modifying: false,
            hooks: Hooks::default(),
        }
    }

    pub fn state(&self) -> CallStateName {
        self.state
    }

    pub fn caller(&self) -> bool {
        self.caller
    }

    pub fn has_local_media(&self) -> bool {
        self.has_media
    }

    pub fn has_local_media_approval(&self) -> bool {
        self.has_media_approval
    }

    pub fn is_media_flowing(&self) -> bool {
        self.media_flowing
    }

    /// True between entry to `Modifying` (or a modify-driven re-prepare)
    /// and the next entry to `Connected` or `Terminated`.
    pub fn is_modifying(&self) -> bool {
        self.modifying
    }

    /// Whether the call is established and carrying media.
    pub fn is_active(&self) -> bool {
        self.state == CallStateName::Connected && self.media_flowing
    }

    pub fn is_terminated(&self) -> bool {
        self.state == CallStateName::Terminated
    }

    /// Register a hook for `<state>:entry`.
    pub fn on_entry(&mut self, state: CallStateName, hook: impl Fn(&Transition) + Send + 'static) {
        self.hooks.entry.push((state, Box::new(hook)));
    }

    /// Register a hook for `<state>:exit`.
    pub fn on_exit(&mut self, state: CallStateName, hook: impl Fn(&Transition) + Send + 'static) {
        self.hooks.exit.push((state, Box::new(hook)));
    }

    /// Register a hook that fires on every state change, after the
    /// per-state exit and entry hooks.
    pub fn on_transition(&mut self, hook: impl Fn(&Transition) + Send + 'static) {
        self.hooks.any.push(Box::new(hook));
    }

    /// Dispatch one event. Returns the transition when the state changed,
    /// `None` when the event only updated flags or was ignored.
    pub fn dispatch(&mut self, event: CallEvent) -> Option<Transition> {
        use CallEvent as E;
        use CallStateName as S;

        if self.state == S::Terminated {
            return None;
        }

        let next = match (self.state, event) {
            (S::Idle, E::Initiate { client_listening }) => {
                if client_listening {
                    Some(S::Preparing)
                } else {
                    Some(S::Terminated)
                }
            }
            (S::Idle, E::Hangup) => Some(S::Terminated),

            (S::Preparing, E::Answer) if !self.media_flowing => Some(S::ApprovingDeviceAccess),
            // Idempotent accept after a modify round-trip already re-prepared.
            (S::Preparing, E::Accept) => Some(S::Preparing),
            (S::Preparing, E::Reject) if !self.media_flowing => Some(S::Terminated),
            (S::Preparing, E::Hangup) => Some(S::Terminated),

            (S::ApprovingDeviceAccess, E::Approve) => Some(S::ApprovingContent),
            (S::ApprovingDeviceAccess, E::Reject) => Some(S::Terminated),
            (S::ApprovingDeviceAccess, E::Hangup) => Some(S::Terminated),

            (S::ApprovingContent, E::Approve) => {
                self.has_media_approval = true;
                if self.has_media {
                    Some(self.post_gather_state())
                } else {
                    Some(S::ApprovingContent)
                }
            }
            (S::ApprovingContent, E::ReceiveLocalMedia) => {
                self.has_media = true;
                if self.has_media_approval {
                    Some(self.post_gather_state())
                } else {
                    Some(S::ApprovingContent)
                }
            }
            (S::ApprovingContent, E::Reject) => Some(S::Terminated),
            (S::ApprovingContent, E::Hangup) => Some(S::Terminated),

            (S::Offering, E::ReceiveLocalMedia) => {
                self.has_media = true;
                Some(S::Offering)
            }
            (S::Offering, E::SentOffer) => Some(S::Offering),
            (S::Offering, E::ReceiveAnswer) => Some(S::Connecting),
            (S::Offering, E::Reject) => Some(S::Terminated),
            (S::Offering, E::Hangup) => Some(S::Terminated),

            (S::Connecting, E::ReceiveRemoteMedia) => Some(S::Connected),
            (S::Connecting, E::Reject) => Some(S::Terminated),
            (S::Connecting, E::Hangup) => Some(S::Terminated),

            (S::Connected, E::Modify { receive: false }) => Some(S::Modifying),
            (S::Connected, E::Modify { receive: true }) => {
                self.caller = false;
                self.modifying = true;
                Some(S::Preparing)
            }
            // Signaling-level reject of a losing fork; the call stays up.
            (S::Connected, E::Reject) if self.media_flowing => Some(S::Connected),
            (S::Connected, E::Reject) => Some(S::Terminated),
            (S::Connected, E::Hangup) => Some(S::Terminated),

            (S::Modifying, E::Accept) => {
                self.caller = true;
                Some(S::Preparing)
            }
            (S::Modifying, E::Reject) => Some(S::Connected),
            (S::Modifying, E::Hangup) => Some(S::Terminated),

            _ => None,
        }?;

        if next == self.state {
            return None;
        }

        let transition = Transition {
            from: self.state,
            to: next,
            event: event.as_str(),
        };
        self.state = next;
        self.apply_entry_flags(next);

        for (state, hook) in &self.hooks.exit {
            if *state == transition.from {
                hook(&transition);
            }
        }
        for (state, hook) in &self.hooks.entry {
            if *state == transition.to {
                hook(&transition);
            }
        }
        for hook in &self.hooks.any {
            hook(&transition);
        }

        Some(transition)
    }

    /// Where media gathering completion lands: the caller goes on to emit
    /// an offer, the callee straight to connecting.
    fn post_gather_state(&self) -> CallStateName {
        if self.caller {
            CallStateName::Offering
        } else {
            CallStateName::Connecting
        }
    }

    fn apply_entry_flags(&mut self, entered: CallStateName) {
        use CallStateName as S;
        match entered {
            S::Connected => {
                self.media_flowing = true;
                self.modifying = false;
            }
            S::Modifying => {
                self.modifying = true;
            }
            S::Preparing => {
                // Renegotiation starts media gathering over.
                self.media_flowing = false;
                self.has_media = false;
                self.has_media_approval = false;
            }
            S::Terminated => {
                self.media_flowing = false;
                self.modifying = false;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    fn recorded(fsm: &mut CallFsm) -> Arc<Mutex<Vec<String>>> {
        let record = Arc::new(Mutex::new(Vec::new()));
        for state in [
            CallStateName::Idle,
            CallStateName::Preparing,
            CallStateName::ApprovingDeviceAccess,
            CallStateName::ApprovingContent,
            CallStateName::Offering,
            CallStateName::Connecting,
            CallStateName::Connected,
            CallStateName::Modifying,
            CallStateName::Terminated,
        ] {
            let r = record.clone();
            fsm.on_exit(state, move |t| {
                r.lock().unwrap().push(format!("{}:exit", t.from));
            });
            let r = record.clone();
            fsm.on_entry(state, move |t| {
                r.lock().unwrap().push(format!("{}:entry", t.to));
            });
        }
        record
    }

    fn entries(record: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        record
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.ends_with(":entry"))
            .map(|e| e.trim_end_matches(":entry").to_string())
            .collect()
    }

    fn connected_caller() -> CallFsm {
        let mut fsm = CallFsm::new(true);
        fsm.dispatch(CallEvent::Initiate {
            client_listening: true,
        });
        fsm.dispatch(CallEvent::Answer);
        fsm.dispatch(CallEvent::Approve);
        fsm.dispatch(CallEvent::ReceiveLocalMedia);
        fsm.dispatch(CallEvent::Approve);
        fsm.dispatch(CallEvent::SentOffer);
        fsm.dispatch(CallEvent::ReceiveAnswer);
        fsm.dispatch(CallEvent::ReceiveRemoteMedia);
        assert_eq!(fsm.state(), CallStateName::Connected);
        fsm
    }

    /// Caller happy path: idle through connected, entries in order.
    #[test]
    fn test_caller_happy_path() {
        let mut fsm = CallFsm::new(true);
        let record = recorded(&mut fsm);

        fsm.dispatch(CallEvent::Initiate {
            client_listening: true,
        });
        fsm.dispatch(CallEvent::Answer);
        fsm.dispatch(CallEvent::Approve);
        fsm.dispatch(CallEvent::ReceiveLocalMedia);
        fsm.dispatch(CallEvent::Approve);
        fsm.dispatch(CallEvent::SentOffer);
        fsm.dispatch(CallEvent::ReceiveAnswer);
        fsm.dispatch(CallEvent::ReceiveRemoteMedia);

        assert_eq!(fsm.state(), CallStateName::Connected);
        assert!(fsm.is_active());
        assert_eq!(
            entries(&record),
            vec![
                "preparing",
                "approvingDeviceAccess",
                "approvingContent",
                "offering",
                "connecting",
                "connected",
            ]
        );
    }

    /// Callee happy path ends in connecting, then connected on remote media.
    #[test]
    fn test_callee_happy_path() {
        let mut fsm = CallFsm::new(false);

        fsm.dispatch(CallEvent::Initiate {
            client_listening: true,
        });
        fsm.dispatch(CallEvent::Answer);
        fsm.dispatch(CallEvent::Approve);
        fsm.dispatch(CallEvent::ReceiveLocalMedia);
        fsm.dispatch(CallEvent::Approve);

        assert_eq!(fsm.state(), CallStateName::Connecting);

        fsm.dispatch(CallEvent::ReceiveRemoteMedia);
        assert_eq!(fsm.state(), CallStateName::Connected);
    }

    /// Approval before media: the second approve stays in approvingContent
    /// until local media lands, then gathering completion moves on.
    #[test]
    fn test_approval_before_media() {
        let mut fsm = CallFsm::new(true);
        fsm.dispatch(CallEvent::Initiate {
            client_listening: true,
        });
        fsm.dispatch(CallEvent::Answer);
        fsm.dispatch(CallEvent::Approve);

        assert!(fsm.dispatch(CallEvent::Approve).is_none());
        assert_eq!(fsm.state(), CallStateName::ApprovingContent);
        assert!(fsm.has_local_media_approval());
        assert!(!fsm.has_local_media());

        let t = fsm.dispatch(CallEvent::ReceiveLocalMedia).unwrap();
        assert_eq!(t.to, CallStateName::Offering);
        assert!(fsm.has_local_media());
    }

    /// Initiate without an incoming-call listener terminates immediately.
    #[test]
    fn test_initiate_without_listener_terminates() {
        let mut fsm = CallFsm::new(false);
        let t = fsm
            .dispatch(CallEvent::Initiate {
                client_listening: false,
            })
            .unwrap();
        assert_eq!(t.to, CallStateName::Terminated);
    }

    /// Every event not in a state's row leaves the state unchanged and
    /// fires no hook.
    #[test]
    fn test_unlisted_events_are_ignored() {
        let all_events = [
            CallEvent::Initiate {
                client_listening: true,
            },
            CallEvent::Answer,
            CallEvent::Approve,
            CallEvent::ReceiveLocalMedia,
            CallEvent::SentOffer,
            CallEvent::ReceiveAnswer,
            CallEvent::ReceiveRemoteMedia,
            CallEvent::Accept,
            CallEvent::Modify { receive: false },
            CallEvent::Reject,
            CallEvent::Hangup,
        ];

        // In idle, only initiate and hangup do anything.
        for event in all_events {
            if matches!(event, CallEvent::Initiate { .. } | CallEvent::Hangup) {
                continue;
            }
            let mut fsm = CallFsm::new(true);
            let record = recorded(&mut fsm);
            assert!(fsm.dispatch(event).is_none(), "{event:?} should be ignored");
            assert_eq!(fsm.state(), CallStateName::Idle);
            assert!(record.lock().unwrap().is_empty());
        }

        // In connecting, sentOffer and receiveAnswer are unlisted.
        let mut fsm = CallFsm::new(true);
        fsm.dispatch(CallEvent::Initiate {
            client_listening: true,
        });
        fsm.dispatch(CallEvent::Answer);
        fsm.dispatch(CallEvent::Approve);
        fsm.dispatch(CallEvent::ReceiveLocalMedia);
        fsm.dispatch(CallEvent::Approve);
        fsm.dispatch(CallEvent::SentOffer);
        fsm.dispatch(CallEvent::ReceiveAnswer);
        assert_eq!(fsm.state(), CallStateName::Connecting);
        assert!(fsm.dispatch(CallEvent::SentOffer).is_none());
        assert!(fsm.dispatch(CallEvent::ReceiveAnswer).is_none());
        assert_eq!(fsm.state(), CallStateName::Connecting);
    }

    /// Exit fires before entry, each exactly once per change.
    #[test]
    fn test_exit_before_entry_ordering() {
        let mut fsm = CallFsm::new(true);
        let record = recorded(&mut fsm);

        fsm.dispatch(CallEvent::Initiate {
            client_listening: true,
        });
        fsm.dispatch(CallEvent::Answer);

        let events = record.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "idle:exit",
                "preparing:entry",
                "preparing:exit",
                "approvingDeviceAccess:entry",
            ]
        );
    }

    /// Nothing leaves terminated, and nothing fires after it.
    #[test]
    fn test_terminated_is_terminal() {
        let mut fsm = CallFsm::new(true);
        fsm.dispatch(CallEvent::Initiate {
            client_listening: true,
        });
        fsm.dispatch(CallEvent::Hangup);
        assert!(fsm.is_terminated());

        let record = recorded(&mut fsm);
        let all_events = [
            CallEvent::Initiate {
                client_listening: true,
            },
            CallEvent::Answer,
            CallEvent::Approve,
            CallEvent::ReceiveLocalMedia,
            CallEvent::SentOffer,
            CallEvent::ReceiveAnswer,
            CallEvent::ReceiveRemoteMedia,
            CallEvent::Accept,
            CallEvent::Modify { receive: false },
            CallEvent::Reject,
            CallEvent::Hangup,
        ];
        for event in all_events {
            assert!(fsm.dispatch(event).is_none());
        }
        assert!(fsm.is_terminated());
        assert!(record.lock().unwrap().is_empty());
    }

    /// Modify initiator round-trip: connected -> modifying -> preparing,
    /// with the caller flag restored and media flags reset.
    #[test]
    fn test_modify_initiator_round_trip() {
        let mut fsm = connected_caller();

        fsm.dispatch(CallEvent::Modify { receive: false });
        assert_eq!(fsm.state(), CallStateName::Modifying);
        assert!(fsm.is_modifying());

        fsm.dispatch(CallEvent::Accept);
        assert_eq!(fsm.state(), CallStateName::Preparing);
        assert!(fsm.caller());
        assert!(!fsm.has_local_media());
        assert!(!fsm.has_local_media_approval());
        assert!(fsm.is_modifying());
    }

    /// Modify receiver re-prepares as the callee.
    #[test]
    fn test_modify_receive_reprepares_as_callee() {
        let mut fsm = connected_caller();

        fsm.dispatch(CallEvent::Modify { receive: true });
        assert_eq!(fsm.state(), CallStateName::Preparing);
        assert!(!fsm.caller());
        assert!(fsm.is_modifying());
        assert!(!fsm.has_local_media());
        assert!(!fsm.has_local_media_approval());

        // Media was torn down for renegotiation, so answer is allowed.
        let t = fsm.dispatch(CallEvent::Answer).unwrap();
        assert_eq!(t.to, CallStateName::ApprovingDeviceAccess);
    }

    /// A rejected modify returns to connected and clears isModifying.
    #[test]
    fn test_modify_rejected_returns_to_connected() {
        let mut fsm = connected_caller();

        fsm.dispatch(CallEvent::Modify { receive: false });
        assert!(fsm.is_modifying());

        fsm.dispatch(CallEvent::Reject);
        assert_eq!(fsm.state(), CallStateName::Connected);
        assert!(!fsm.is_modifying());
    }

    /// isModifying spans from modify entry to the next connected entry.
    #[test]
    fn test_is_modifying_window() {
        let mut fsm = connected_caller();
        assert!(!fsm.is_modifying());

        fsm.dispatch(CallEvent::Modify { receive: false });
        fsm.dispatch(CallEvent::Accept);
        assert!(fsm.is_modifying());

        fsm.dispatch(CallEvent::Answer);
        fsm.dispatch(CallEvent::Approve);
        fsm.dispatch(CallEvent::ReceiveLocalMedia);
        fsm.dispatch(CallEvent::Approve);
        assert!(fsm.is_modifying());

        fsm.dispatch(CallEvent::SentOffer);
        fsm.dispatch(CallEvent::ReceiveAnswer);
        fsm.dispatch(CallEvent::ReceiveRemoteMedia);
        assert_eq!(fsm.state(), CallStateName::Connected);
        assert!(!fsm.is_modifying());
    }

    /// Reject while media flows keeps the established call.
    #[test]
    fn test_reject_with_flowing_media_is_noop() {
        let mut fsm = connected_caller();
        let record = recorded(&mut fsm);

        assert!(fsm.dispatch(CallEvent::Reject).is_none());
        assert_eq!(fsm.state(), CallStateName::Connected);
        assert!(record.lock().unwrap().is_empty());
    }

    /// Reject before media flows tears the call down.
    #[test]
    fn test_reject_before_media_terminates() {
        let mut fsm = CallFsm::new(false);
        fsm.dispatch(CallEvent::Initiate {
            client_listening: true,
        });
        assert_eq!(fsm.state(), CallStateName::Preparing);

        fsm.dispatch(CallEvent::Reject);
        assert!(fsm.is_terminated());
    }

    /// receiveLocalMedia while offering only sets the flag.
    #[test]
    fn test_late_local_media_in_offering() {
        let mut fsm = CallFsm::new(true);
        fsm.dispatch(CallEvent::Initiate {
            client_listening: true,
        });
        fsm.dispatch(CallEvent::Answer);
        fsm.dispatch(CallEvent::Approve);
        fsm.dispatch(CallEvent::Approve);
        fsm.dispatch(CallEvent::ReceiveLocalMedia);
        assert_eq!(fsm.state(), CallStateName::Offering);

        // Duplicate delivery stays put and keeps the flag.
        assert!(fsm.dispatch(CallEvent::ReceiveLocalMedia).is_none());
        assert_eq!(fsm.state(), CallStateName::Offering);
        assert!(fsm.has_local_media());
    }
}
