//! # Instructions
//!
//! The unit of durable work: everything one job still has to do, expressed
//! as an ordered sequence of rounds. An `Instructions` value is owned
//! exclusively by whichever message currently carries it; every
//! transformation produces a new value attached to a new outbound message.
//! Nothing here mutates in place and nothing is shared.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::{AuthMaterial, Command};

/// Full remaining work for one job.
///
/// The round cursor is implicit on the wire: `commands[0]` is always the
/// current round; advancing drops it, narrowing replaces it with its failed
/// subset. `completed_rounds` counts rounds already dropped so a terminal
/// redelivery can be told apart from a job that never had work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instructions {
    pub id: Uuid,
    #[serde(rename = "orgID")]
    pub org_id: Uuid,
    #[serde(rename = "definitionID")]
    pub definition_id: Uuid,
    #[serde(default)]
    pub auth: AuthMaterial,
    /// Rounds, outermost first; each inner list executes concurrently
    pub commands: Vec<Vec<Command>>,
    #[serde(rename = "neverTerminate", default)]
    pub never_terminate: bool,
    #[serde(rename = "completedRounds", default)]
    pub completed_rounds: u64,
}

impl Instructions {
    pub fn new(org_id: Uuid, definition_id: Uuid, rounds: Vec<Vec<Command>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id,
            definition_id,
            auth: AuthMaterial::default(),
            commands: rounds,
            never_terminate: false,
            completed_rounds: 0,
        }
    }

    /// The round that should execute next, or `None` past the last round.
    pub fn peek_round(&self) -> Option<&[Command]> {
        self.commands.first().map(|round| round.as_slice())
    }

    /// True when the job has no remaining rounds but did complete at least
    /// one: a redelivery of an already-finished job.
    pub fn is_finished(&self) -> bool {
        self.commands.is_empty() && self.completed_rounds > 0
    }

    /// True when there was never any work to do.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.completed_rounds == 0
    }

    /// Whether the current round is the last one.
    pub fn on_final_round(&self) -> bool {
        self.commands.len() == 1
    }

    /// Rounds left to execute.
    pub fn steps_left(&self) -> usize {
        self.commands.len()
    }

    /// Drop the completed current round, producing the next job state.
    pub fn advance(mut self) -> Self {
        if !self.commands.is_empty() {
            self.commands.remove(0);
            self.completed_rounds += 1;
        }
        self
    }

    /// Replace the current round with only its failed commands, preserving
    /// their original order. Commands whose IDs are not listed are dropped
    /// as already completed. The cursor does not move.
    pub fn narrow(mut self, failed_ids: &[Uuid]) -> Self {
        if let Some(current) = self.commands.first_mut() {
            current.retain(|cmd| failed_ids.contains(&cmd.id));
        }
        self
    }
}

/// External lookup answering "has this command already executed?". Used to
/// gate dependent commands when building rounds; the engine itself keeps no
/// completed-set state.
pub trait CompletedSetLookup: Send + Sync {
    fn is_complete(&self, command_id: &Uuid) -> bool;
}

/// Split commands into those whose dependencies are all satisfied and those
/// that must wait. Intended for submitters assembling rounds; rounds handed
/// to the executor are presumed already independent.
pub fn gate_commands(
    commands: Vec<Command>,
    lookup: &dyn CompletedSetLookup,
) -> (Vec<Command>, Vec<Command>) {
    commands
        .into_iter()
        .partition(|cmd| cmd.depends_on.iter().all(|dep| lookup.is_complete(dep)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Order, Target};
    use std::collections::HashSet;
    use std::time::Duration;

    fn command(name: &str) -> Command {
        Command::new(
            Target::new("10.0.0.1"),
            Order::StartContainer {
                name: name.to_string(),
            },
            Duration::from_secs(10),
        )
    }

    fn two_round_job() -> Instructions {
        Instructions::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            vec![vec![command("a"), command("b")], vec![command("c")]],
        )
    }

    #[test]
    fn test_advance_moves_cursor_forward_only() {
        let job = two_round_job();
        let first_round_len = job.peek_round().map(|r| r.len());
        assert_eq!(first_round_len, Some(2));

        let job = job.advance();
        assert_eq!(job.completed_rounds, 1);
        assert_eq!(job.peek_round().map(|r| r.len()), Some(1));
        assert!(job.on_final_round());

        let job = job.advance();
        assert!(job.is_finished());
        assert!(!job.is_empty());
        assert!(job.peek_round().is_none());

        // Advancing past the end stays put.
        let job = job.advance();
        assert_eq!(job.completed_rounds, 2);
    }

    #[test]
    fn test_narrow_keeps_only_failed_commands() {
        let mut job = two_round_job();
        let round: Vec<Command> = (0..5).map(|i| command(&format!("n{i}"))).collect();
        let failed = vec![round[1].id, round[3].id];
        job.commands[0] = round;

        let narrowed = job.narrow(&failed);
        let ids: Vec<Uuid> = narrowed
            .peek_round()
            .expect("round present")
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, failed);
        // Cursor untouched.
        assert_eq!(narrowed.completed_rounds, 0);
        assert_eq!(narrowed.steps_left(), 2);
    }

    #[test]
    fn test_empty_vs_finished() {
        let empty = Instructions::new(Uuid::new_v4(), Uuid::new_v4(), vec![]);
        assert!(empty.is_empty());
        assert!(!empty.is_finished());
    }

    #[test]
    fn test_wire_field_names() {
        let job = two_round_job();
        let json = serde_json::to_value(&job).expect("serialize");
        assert!(json.get("orgID").is_some());
        assert!(json.get("definitionID").is_some());
        assert!(json.get("neverTerminate").is_some());
        assert!(json.get("commands").is_some());
    }

    struct SetLookup(HashSet<Uuid>);

    impl CompletedSetLookup for SetLookup {
        fn is_complete(&self, command_id: &Uuid) -> bool {
            self.0.contains(command_id)
        }
    }

    #[test]
    fn test_dependency_gate() {
        let done = command("done");
        let mut ready = command("ready");
        ready.depends_on = vec![done.id];
        let mut blocked = command("blocked");
        blocked.depends_on = vec![Uuid::new_v4()];

        let lookup = SetLookup(HashSet::from([done.id]));
        let (runnable, deferred) = gate_commands(vec![ready.clone(), blocked.clone()], &lookup);

        assert_eq!(runnable.len(), 1);
        assert_eq!(runnable[0].id, ready.id);
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].id, blocked.id);
    }
}
