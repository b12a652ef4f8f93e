//! Property-based tests for WISP
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Destination Address Properties
// ============================================================================

mod dst_addr_properties {
    use super::*;
    use wisp_transport::DstAddr;
    use wisp_transport::candidate::DST_ADDR_LEN;

    proptest! {
        /// Derived addresses are always 40 lowercase hex characters
        #[test]
        fn derived_is_lowercase_hex(
            sid in "[a-zA-Z0-9]{1,64}",
            initiator in "[a-z]{1,12}@[a-z]{1,12}/[a-z0-9]{1,8}",
            target in "[a-z]{1,12}@[a-z]{1,12}/[a-z0-9]{1,8}",
        ) {
            let dst = DstAddr::derive(&sid, &initiator, &target);
            prop_assert_eq!(dst.as_str().len(), DST_ADDR_LEN);
            prop_assert!(dst.as_str().bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
        }

        /// Both peers derive the same address; swapping roles changes it
        #[test]
        fn derivation_is_deterministic_and_ordered(
            sid in "[a-f0-9]{32}",
            initiator in "[a-z]{1,12}@example\\.org/[a-z]{1,4}",
            target in "[a-z]{1,12}@example\\.net/[a-z]{1,4}",
        ) {
            let a = DstAddr::derive(&sid, &initiator, &target);
            let b = DstAddr::derive(&sid, &initiator, &target);
            prop_assert_eq!(&a, &b);
            prop_assert_ne!(a, DstAddr::derive(&sid, &target, &initiator));
        }

        /// Parsing accepts exactly what derivation produces, case-folded
        #[test]
        fn parse_accepts_derived(sid in "[a-z0-9]{1,32}") {
            let dst = DstAddr::derive(&sid, "a@x/1", "b@y/2");
            prop_assert_eq!(DstAddr::parse(dst.as_str()), Some(dst.clone()));
            prop_assert_eq!(DstAddr::parse(&dst.as_str().to_ascii_uppercase()), Some(dst));
        }

        /// Anything that is not 40 hex characters is refused
        #[test]
        fn parse_rejects_wrong_length(raw in "[a-f0-9]{0,39}|[a-f0-9]{41,80}") {
            prop_assert!(DstAddr::parse(&raw).is_none());
        }
    }
}

// ============================================================================
// File Name Sanitizing Properties
// ============================================================================

mod file_name_properties {
    use super::*;
    use wisp_core::offer::safe_file_name;

    proptest! {
        /// Whatever survives is a single, non-traversing path component
        #[test]
        fn sanitized_name_is_one_component(name in "\\PC{0,64}") {
            if let Some(safe) = safe_file_name(&name) {
                prop_assert!(!safe.is_empty());
                prop_assert!(!safe.contains('/'));
                prop_assert!(!safe.contains('\\'));
                prop_assert!(!safe.contains(':'));
                prop_assert_ne!(safe.as_str(), "..");
                prop_assert_ne!(safe.as_str(), ".");
            }
        }

        /// Plain names pass through unchanged
        #[test]
        fn plain_names_unchanged(name in "[a-zA-Z0-9_-]{1,32}(\\.[a-z]{1,4})?") {
            prop_assert_eq!(safe_file_name(&name), Some(name));
        }

        /// Names with a parent component are always refused
        #[test]
        fn traversal_refused(
            prefix in "([a-z]{1,8}/){0,3}",
            suffix in "(/[a-z]{1,8}){0,3}",
        ) {
            let name = format!("{prefix}..{suffix}");
            prop_assert_eq!(safe_file_name(&name), None);
        }

        /// Absolute paths are always refused
        #[test]
        fn absolute_refused(rest in "[a-z/]{0,32}") {
            prop_assert_eq!(safe_file_name(&format!("/{rest}")), None);
            prop_assert_eq!(safe_file_name(&format!("\\{rest}")), None);
        }
    }
}

// ============================================================================
// Negotiation State Machine Properties
// ============================================================================

mod state_properties {
    use super::*;
    use wisp_core::NegotiationState;

    fn any_state() -> impl Strategy<Value = NegotiationState> {
        prop_oneof![
            Just(NegotiationState::Offered),
            Just(NegotiationState::Accepted),
            Just(NegotiationState::Rejected),
            Just(NegotiationState::TransportPending),
            Just(NegotiationState::TransportReady),
            Just(NegotiationState::DataPhase),
            Just(NegotiationState::Closed),
        ]
    }

    fn rank(state: NegotiationState) -> u8 {
        match state {
            NegotiationState::Offered => 0,
            NegotiationState::Accepted | NegotiationState::Rejected => 1,
            NegotiationState::TransportPending => 2,
            NegotiationState::TransportReady => 3,
            NegotiationState::DataPhase => 4,
            NegotiationState::Closed => 5,
        }
    }

    proptest! {
        /// Terminal states have no way out
        #[test]
        fn terminal_is_final(from in any_state(), to in any_state()) {
            if from.is_terminal() {
                prop_assert!(!from.can_transition_to(to));
            }
        }

        /// Every live state can close
        #[test]
        fn live_states_can_close(state in any_state()) {
            prop_assert_eq!(
                state.can_transition_to(NegotiationState::Closed),
                !state.is_terminal()
            );
        }

        /// Transitions only move forward
        #[test]
        fn transitions_move_forward(from in any_state(), to in any_state()) {
            if from.can_transition_to(to) {
                prop_assert!(rank(to) > rank(from));
            }
        }

        /// Once terminal, a random walk over legal steps never moves again
        #[test]
        fn random_walk_halts_at_terminal(steps in prop::collection::vec(any_state(), 0..32)) {
            let mut state = NegotiationState::Offered;
            let mut terminal_at = None;
            for (i, next) in steps.into_iter().enumerate() {
                if state.can_transition_to(next) {
                    prop_assert!(terminal_at.is_none(), "moved after terminal at step {:?}", terminal_at);
                    state = next;
                    if state.is_terminal() {
                        terminal_at = Some(i);
                    }
                }
            }
        }
    }
}

// ============================================================================
// Offer Wire Format Properties
// ============================================================================

mod stanza_properties {
    use super::*;
    use wisp_core::{SessionId, Stanza, TransferOffer};
    use wisp_transport::StreamHostCandidate;

    fn candidate() -> impl Strategy<Value = StreamHostCandidate> {
        ("[a-z]{1,10}\\.example\\.org", "10\\.0\\.[0-9]{1,3}\\.[0-9]{1,3}", 1u16..)
            .prop_map(|(host, address, port)| StreamHostCandidate::new(host, address, port))
    }

    proptest! {
        /// Candidate order survives the wire
        #[test]
        fn offer_preserves_candidate_order(
            candidates in prop::collection::vec(candidate(), 1..8),
            size in any::<u64>(),
        ) {
            let stanza = Stanza::Offer {
                sid: SessionId::generate(),
                offer: TransferOffer::new("alice@example.org/a", "bob@example.org/b", "a.txt", size),
                candidates: candidates.clone(),
            };

            let json = serde_json::to_string(&stanza).unwrap();
            let parsed: Stanza = serde_json::from_str(&json).unwrap();
            match parsed {
                Stanza::Offer { candidates: wire, offer, .. } => {
                    prop_assert_eq!(wire, candidates);
                    prop_assert_eq!(offer.file_size, size);
                }
                other => prop_assert!(false, "wrong stanza: {}", other.name()),
            }
        }
    }
}
