use std::fmt;

use alarmctl_core::AlarmEvent;
use serde::Serialize;

use crate::error::LinkError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Retrying { attempt: u32 },
    GivenUp,
    Disconnected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    // a new connect must wait while this holds
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Retrying { .. }
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => f.write_str("idle"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Retrying { attempt } => write!(f, "retrying (attempt {attempt})"),
            ConnectionState::GivenUp => f.write_str("given up"),
            ConnectionState::Disconnected => f.write_str("disconnected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Connect,
    // CONNACK received
    Established,
    Failed(String),
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Subscribe,
    Emit(AlarmEvent),
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: ConnectionState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: ConnectionState, effects: Vec<Effect>) -> Self {
        Self { next, effects }
    }

    fn stay(state: ConnectionState) -> Self {
        Self::to(state, Vec::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected(pub ConnectionState);

// Pure: maps state and input to the next state plus the effects the service carries out.
pub fn transition(state: ConnectionState, input: Input, max_retries: u32) -> Result<Transition, Rejected> {
    use ConnectionState::*;

    let transition = match (state, input) {
        (Idle | Disconnected | GivenUp, Input::Connect) => Transition::to(Connecting, Vec::new()),
        (Connecting | Connected | Retrying { .. }, Input::Connect) => return Err(Rejected(state)),

        (Connecting | Retrying { .. }, Input::Established) => Transition::to(
            Connected,
            vec![Effect::Subscribe, Effect::Emit(AlarmEvent::ConnectionChanged(true))],
        ),

        (Connected, Input::Failed(reason)) => {
            let mut effects = vec![
                emit_error(LinkError::Dropped(reason)),
                Effect::Emit(AlarmEvent::ConnectionChanged(false)),
            ];
            next_attempt(1, max_retries, &mut effects)
        }
        (Connecting, Input::Failed(reason)) => {
            let mut effects = vec![emit_error(LinkError::Connect(reason))];
            next_attempt(1, max_retries, &mut effects)
        }
        (Retrying { attempt }, Input::Failed(reason)) => {
            let mut effects = vec![emit_error(LinkError::Connect(reason))];
            next_attempt(attempt.saturating_add(1), max_retries, &mut effects)
        }

        (Connected, Input::Disconnect) => Transition::to(
            Disconnected,
            vec![Effect::Terminate, Effect::Emit(AlarmEvent::ConnectionChanged(false))],
        ),
        (Connecting | Retrying { .. } | GivenUp, Input::Disconnect) => {
            Transition::to(Disconnected, vec![Effect::Terminate])
        }
        (Idle | Disconnected, Input::Disconnect) => Transition::stay(state),

        // late transport news for a link that is already settled
        (_, Input::Established | Input::Failed(_)) => Transition::stay(state),
    };
    Ok(transition)
}

fn next_attempt(attempt: u32, max_retries: u32, effects: &mut Vec<Effect>) -> Transition {
    if attempt > max_retries {
        effects.push(Effect::Terminate);
        effects.push(emit_error(LinkError::RetryExhausted { attempts: max_retries }));
        // the drop path already told observers the link is down
        if !effects.contains(&Effect::Emit(AlarmEvent::ConnectionChanged(false))) {
            effects.push(Effect::Emit(AlarmEvent::ConnectionChanged(false)));
        }
        return Transition::to(ConnectionState::GivenUp, std::mem::take(effects));
    }
    Transition::to(ConnectionState::Retrying { attempt }, std::mem::take(effects))
}

fn emit_error(err: LinkError) -> Effect {
    Effect::Emit(AlarmEvent::ConnectionError(err.to_string()))
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionMachine {
    state: ConnectionState,
    max_retries: u32,
}

impl ConnectionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connect(&mut self, max_retries: u32) -> Result<Vec<Effect>, Rejected> {
        let transition = transition(self.state, Input::Connect, max_retries)?;
        self.max_retries = max_retries;
        self.state = transition.next;
        Ok(transition.effects)
    }

    pub fn step(&mut self, input: Input) -> Result<Vec<Effect>, Rejected> {
        let transition = transition(self.state, input, self.max_retries)?;
        self.state = transition.next;
        Ok(transition.effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    fn step(state: ConnectionState, input: Input) -> Transition {
        transition(state, input, 3).unwrap()
    }

    fn failed() -> Input {
        Input::Failed("connection refused".into())
    }

    fn emitted(t: &Transition) -> Vec<AlarmEvent> {
        t.effects
            .iter()
            .filter_map(|e| match e {
                Effect::Emit(ev) => Some(ev.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn connect_starts_from_any_settled_state() {
        for state in [Idle, Disconnected, GivenUp] {
            assert_eq!(step(state, Input::Connect), Transition::to(Connecting, vec![]));
        }
    }

    #[test]
    fn connect_is_rejected_while_a_link_is_active() {
        for state in [Connecting, Connected, Retrying { attempt: 2 }] {
            assert_eq!(transition(state, Input::Connect, 3), Err(Rejected(state)));
        }
    }

    #[test]
    fn established_subscribes_before_announcing() {
        for state in [Connecting, Retrying { attempt: 3 }] {
            let t = step(state, Input::Established);
            assert_eq!(t.next, Connected);
            assert_eq!(
                t.effects,
                vec![Effect::Subscribe, Effect::Emit(AlarmEvent::ConnectionChanged(true))]
            );
        }
    }

    #[test]
    fn drop_moves_to_first_retry_and_reports_offline() {
        let t = step(Connected, failed());
        assert_eq!(t.next, Retrying { attempt: 1 });
        assert_eq!(
            emitted(&t),
            vec![
                AlarmEvent::ConnectionError("broker connection lost: connection refused".into()),
                AlarmEvent::ConnectionChanged(false),
            ]
        );
        assert!(!t.effects.contains(&Effect::Terminate));
    }

    #[test]
    fn failed_handshakes_count_attempts() {
        let t = step(Connecting, failed());
        assert_eq!(t.next, Retrying { attempt: 1 });
        assert_eq!(
            emitted(&t),
            vec![AlarmEvent::ConnectionError("broker connection failed: connection refused".into())]
        );
        assert_eq!(step(Retrying { attempt: 1 }, failed()).next, Retrying { attempt: 2 });
        assert_eq!(step(Retrying { attempt: 2 }, failed()).next, Retrying { attempt: 3 });
    }

    #[test]
    fn exceeding_the_cap_gives_up_once() {
        let t = step(Retrying { attempt: 3 }, failed());
        assert_eq!(t.next, GivenUp);
        assert!(t.effects.contains(&Effect::Terminate));
        assert_eq!(
            emitted(&t),
            vec![
                AlarmEvent::ConnectionError("broker connection failed: connection refused".into()),
                AlarmEvent::ConnectionError("giving up after 3 reconnect attempts".into()),
                AlarmEvent::ConnectionChanged(false),
            ]
        );

        // nothing the transport reports afterwards revives the link
        assert_eq!(step(GivenUp, failed()), Transition::stay(GivenUp));
        assert_eq!(step(GivenUp, Input::Established), Transition::stay(GivenUp));
    }

    #[test]
    fn zero_retries_gives_up_on_first_drop() {
        let t = transition(Connected, failed(), 0).unwrap();
        assert_eq!(t.next, GivenUp);
        let offline = emitted(&t)
            .into_iter()
            .filter(|e| *e == AlarmEvent::ConnectionChanged(false))
            .count();
        assert_eq!(offline, 1);
    }

    #[test]
    fn disconnect_always_lands_in_disconnected() {
        let t = step(Connected, Input::Disconnect);
        assert_eq!(t.next, Disconnected);
        assert_eq!(
            t.effects,
            vec![Effect::Terminate, Effect::Emit(AlarmEvent::ConnectionChanged(false))]
        );

        for state in [Connecting, Retrying { attempt: 1 }, GivenUp] {
            assert_eq!(step(state, Input::Disconnect), Transition::to(Disconnected, vec![Effect::Terminate]));
        }
    }

    #[test]
    fn disconnect_is_idempotent() {
        for state in [Idle, Disconnected] {
            assert_eq!(step(state, Input::Disconnect), Transition::stay(state));
        }
    }

    #[test]
    fn stale_transport_news_is_ignored_when_settled() {
        for state in [Idle, Disconnected, GivenUp] {
            assert_eq!(step(state, failed()), Transition::stay(state));
            assert_eq!(step(state, Input::Established), Transition::stay(state));
        }
        assert_eq!(step(Connected, Input::Established), Transition::stay(Connected));
    }

    #[test]
    fn machine_walks_a_full_lifecycle() {
        let mut machine = ConnectionMachine::new();
        assert_eq!(machine.state(), Idle);
        machine.connect(2).unwrap();
        assert_eq!(machine.state(), Connecting);
        assert!(machine.connect(2).is_err());

        machine.step(Input::Established).unwrap();
        assert!(machine.state().is_connected());
        machine.step(failed()).unwrap();
        assert_eq!(machine.state(), Retrying { attempt: 1 });
        machine.step(failed()).unwrap();
        assert_eq!(machine.state(), Retrying { attempt: 2 });
        machine.step(Input::Established).unwrap();
        assert_eq!(machine.state(), Connected);

        // counter was reset by the reconnect
        machine.step(failed()).unwrap();
        assert_eq!(machine.state(), Retrying { attempt: 1 });
        machine.step(failed()).unwrap();
        let effects = machine.step(failed()).unwrap();
        assert_eq!(machine.state(), GivenUp);
        assert!(effects.contains(&Effect::Terminate));

        machine.connect(2).unwrap();
        assert_eq!(machine.state(), Connecting);
    }

    #[test]
    fn states_render_for_humans() {
        assert_eq!(Retrying { attempt: 4 }.to_string(), "retrying (attempt 4)");
        assert_eq!(GivenUp.to_string(), "given up");
    }
}
