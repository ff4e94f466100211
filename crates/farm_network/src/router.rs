//! Router: controlled flooding with hop budgets and path-based loop
//! avoidance.
//!
//! The router holds no mutable state. It turns an envelope, the store's
//! first-sight answer and the current set of alive neighbors into a
//! [`RouteDecision`]; the node runtime carries the decision out.

use std::collections::BTreeSet;

use crate::identity::PeerId;
use crate::message::{Envelope, MessageKind, Payload};

/// What a node should do with an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    /// Already handled here; drop silently.
    Duplicate,
    /// Handle locally (maybe) and relay no further.
    Terminal { deliver_local: bool },
    /// Send `envelope` (already stamped with this hop) to `targets`.
    Forward {
        envelope: Envelope,
        targets: Vec<PeerId>,
        deliver_local: bool,
    },
}

/// Pure routing policy for one node.
#[derive(Debug, Clone)]
pub struct Router {
    local_id: PeerId,
}

impl Router {
    pub fn new(local_id: PeerId) -> Self {
        Self { local_id }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Decide how to handle `envelope` at this node.
    ///
    /// `first_sight` is the store's answer to "was this id just inserted".
    pub fn route(
        &self,
        envelope: &Envelope,
        first_sight: bool,
        alive: &BTreeSet<PeerId>,
    ) -> RouteDecision {
        if !first_sight {
            return RouteDecision::Duplicate;
        }

        let deliver_local = self.delivers_locally(envelope);

        // Heartbeats are link-local.
        if envelope.kind() == MessageKind::Heartbeat {
            return RouteDecision::Terminal { deliver_local };
        }
        // A response that reached the asker stops here.
        if let Payload::QueryResponse(resp) = envelope.payload() {
            if resp.query_origin == self.local_id {
                return RouteDecision::Terminal { deliver_local };
            }
        }
        if envelope.ttl_hops() == 0 {
            return RouteDecision::Terminal { deliver_local };
        }

        let forwarded = envelope.forwarded_by(&self.local_id);
        let targets = match self.reverse_hop(&forwarded, alive) {
            Some(hop) => vec![hop],
            None => self.flood_targets(&forwarded, alive, &[]),
        };
        RouteDecision::Forward {
            envelope: forwarded,
            targets,
            deliver_local,
        }
    }

    /// Targets for a retry round: alive neighbors not on the path and not
    /// already reached. Retries always flood.
    pub fn retry_targets(
        &self,
        forwarded: &Envelope,
        alive: &BTreeSet<PeerId>,
        reached: &[PeerId],
    ) -> Vec<PeerId> {
        self.flood_targets(forwarded, alive, reached)
    }

    /// Whether this node hands the envelope to its local bridge.
    pub fn delivers_locally(&self, envelope: &Envelope) -> bool {
        match envelope.payload() {
            Payload::PestAlert(_) | Payload::Query(_) => envelope.origin() != &self.local_id,
            Payload::QueryResponse(resp) => resp.query_origin == self.local_id,
            Payload::Heartbeat(_) => false,
        }
    }

    fn flood_targets(
        &self,
        forwarded: &Envelope,
        alive: &BTreeSet<PeerId>,
        exclude: &[PeerId],
    ) -> Vec<PeerId> {
        alive
            .iter()
            .filter(|peer| **peer != self.local_id)
            .filter(|peer| !forwarded.has_visited(peer))
            .filter(|peer| !exclude.contains(peer))
            .cloned()
            .collect()
    }

    /// Next hop back toward the asker along the query's recorded path, if
    /// that neighbor is alive and has not seen this copy.
    fn reverse_hop(&self, forwarded: &Envelope, alive: &BTreeSet<PeerId>) -> Option<PeerId> {
        let Payload::QueryResponse(resp) = forwarded.payload() else {
            return None;
        };
        let hop = if forwarded.origin() == &self.local_id {
            resp.reply_path.last()?
        } else {
            let pos = resp.reply_path.iter().position(|p| *p == self.local_id)?;
            resp.reply_path.get(pos.checked_sub(1)?)?
        };
        (alive.contains(hop) && !forwarded.has_visited(hop)).then(|| hop.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::Severity;
    use crate::message::{Heartbeat, MessageId, PestAlert, Query, QueryResponse};

    fn pid(s: &str) -> PeerId {
        PeerId::from_string(s)
    }

    fn alive(names: &[&str]) -> BTreeSet<PeerId> {
        names.iter().map(|n| pid(n)).collect()
    }

    fn alert_from(origin: &str, ttl: u8) -> Envelope {
        Envelope::new(
            pid(origin),
            1,
            Payload::PestAlert(PestAlert::new(Severity::High, "north")),
            ttl,
        )
    }

    #[test]
    fn test_duplicate_is_dropped() {
        let router = Router::new(pid("b"));
        let env = alert_from("a", 3);
        assert_eq!(
            router.route(&env, false, &alive(&["a", "c"])),
            RouteDecision::Duplicate
        );
    }

    #[test]
    fn test_forward_excludes_path_and_self() {
        let router = Router::new(pid("b"));
        let env = alert_from("a", 3).forwarded_by(&pid("a"));

        match router.route(&env, true, &alive(&["a", "b", "c", "d"])) {
            RouteDecision::Forward {
                envelope,
                targets,
                deliver_local,
            } => {
                assert!(deliver_local);
                assert_eq!(targets, vec![pid("c"), pid("d")]);
                assert_eq!(envelope.ttl_hops(), 1);
                assert_eq!(envelope.path(), &[pid("a"), pid("b")]);
                assert_eq!(envelope.id(), env.id());
            }
            other => panic!("expected Forward, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_ttl_is_terminal() {
        let router = Router::new(pid("c"));
        let env = alert_from("a", 2)
            .forwarded_by(&pid("a"))
            .forwarded_by(&pid("b"));
        assert_eq!(env.ttl_hops(), 0);
        assert_eq!(
            router.route(&env, true, &alive(&["b", "d"])),
            RouteDecision::Terminal {
                deliver_local: true
            }
        );
    }

    #[test]
    fn test_originator_does_not_deliver_own_alert() {
        let router = Router::new(pid("a"));
        let env = alert_from("a", 2);
        match router.route(&env, true, &alive(&["b"])) {
            RouteDecision::Forward {
                targets,
                deliver_local,
                envelope,
            } => {
                assert!(!deliver_local);
                assert_eq!(targets, vec![pid("b")]);
                assert_eq!(envelope.path(), &[pid("a")]);
            }
            other => panic!("expected Forward, got {other:?}"),
        }
    }

    #[test]
    fn test_heartbeat_never_relayed() {
        let router = Router::new(pid("b"));
        let env = Envelope::new(
            pid("a"),
            9,
            Payload::Heartbeat(Heartbeat {
                address: "a:1".into(),
            }),
            1,
        );
        assert_eq!(
            router.route(&env, true, &alive(&["a", "c"])),
            RouteDecision::Terminal {
                deliver_local: false
            }
        );
    }

    #[test]
    fn test_query_delivered_and_flooded() {
        let router = Router::new(pid("b"));
        let env = Envelope::new(
            pid("a"),
            2,
            Payload::Query(Query {
                text: "aphids?".into(),
            }),
            3,
        )
        .forwarded_by(&pid("a"));
        match router.route(&env, true, &alive(&["a", "c"])) {
            RouteDecision::Forward {
                targets,
                deliver_local,
                ..
            } => {
                assert!(deliver_local);
                assert_eq!(targets, vec![pid("c")]);
            }
            other => panic!("expected Forward, got {other:?}"),
        }
    }

    fn response(responder: &str, reply_path: &[&str]) -> Envelope {
        Envelope::new(
            pid(responder),
            5,
            Payload::QueryResponse(QueryResponse {
                query_id: MessageId::from("a:2"),
                query_origin: pid("a"),
                reply_path: reply_path.iter().map(|p| pid(p)).collect(),
                text: "yes, zone 3".into(),
            }),
            4,
        )
    }

    #[test]
    fn test_response_short_circuits_back_along_path() {
        // Query went a -> b -> c; c answers.
        let at_c = Router::new(pid("c"));
        let env = response("c", &["a", "b"]);
        match at_c.route(&env, true, &alive(&["b", "d"])) {
            RouteDecision::Forward { targets, .. } => assert_eq!(targets, vec![pid("b")]),
            other => panic!("expected Forward, got {other:?}"),
        }

        let at_b = Router::new(pid("b"));
        let env = env.forwarded_by(&pid("c"));
        match at_b.route(&env, true, &alive(&["a", "c", "e"])) {
            RouteDecision::Forward {
                targets,
                deliver_local,
                ..
            } => {
                assert!(!deliver_local);
                assert_eq!(targets, vec![pid("a")]);
            }
            other => panic!("expected Forward, got {other:?}"),
        }

        let at_a = Router::new(pid("a"));
        let env = env.forwarded_by(&pid("b"));
        assert_eq!(
            at_a.route(&env, true, &alive(&["b"])),
            RouteDecision::Terminal {
                deliver_local: true
            }
        );
    }

    #[test]
    fn test_response_floods_when_reverse_hop_is_down() {
        let at_c = Router::new(pid("c"));
        let env = response("c", &["a", "b"]);
        match at_c.route(&env, true, &alive(&["d", "e"])) {
            RouteDecision::Forward { targets, .. } => {
                assert_eq!(targets, vec![pid("d"), pid("e")]);
            }
            other => panic!("expected Forward, got {other:?}"),
        }
    }

    #[test]
    fn test_retry_targets_skip_reached() {
        let router = Router::new(pid("a"));
        let forwarded = alert_from("a", 3).forwarded_by(&pid("a"));
        let targets = router.retry_targets(&forwarded, &alive(&["b", "c", "d"]), &[pid("c")]);
        assert_eq!(targets, vec![pid("b"), pid("d")]);
    }
}
