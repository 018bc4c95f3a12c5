//! Property-based testing for DSM buffer reads and writes
//!
//! Random sequences of Put/Get against an in-process cluster of three
//! server ranks are checked against a flat byte vector. The layout is drawn
//! once per case, so every policy sees the same model.

mod common;

use proptest::prelude::*;
use proptest_state_machine::{prop_state_machine, ReferenceStateMachine, StateMachineTest};

use dsmbuf::buffer::DsmBuffer;
use dsmbuf::layout::{LayoutSpec, MixedExtent};

use common::{start_cluster, stop_cluster, Servers};

/// Servers in every generated cluster
const SERVERS: usize = 3;
/// Per-server length for the regular layouts
const LENGTH: u64 = 256;
/// Page size for the block layouts
const BLOCK: u64 = 32;
/// Largest single transfer
const MAX_TRANSFER: usize = 300;

/// Buffer operation transitions for the state machine
#[derive(Clone, Debug)]
pub enum Transition {
    /// Write data at a global address
    Put { address: u64, data: Vec<u8> },
    /// Read back a global range
    Get { address: u64, length: usize },
}

/// Reference model: the whole buffer as one vector
#[derive(Clone, Debug)]
pub struct BufferRefState {
    spec: LayoutSpec,
    bytes: Vec<u8>,
}

fn layout_strategy() -> BoxedStrategy<LayoutSpec> {
    prop_oneof![
        Just(LayoutSpec::uniform(LENGTH)),
        Just(LayoutSpec::block_cyclic(LENGTH, BLOCK)),
        any::<u64>().prop_map(|seed| LayoutSpec::block_random(LENGTH, BLOCK, seed)),
        prop::collection::vec((0..SERVERS, 1u64..200), 1..8).prop_map(|extents| {
            LayoutSpec::mixed(
                extents
                    .into_iter()
                    .map(|(rank, length)| MixedExtent { rank, length })
                    .collect(),
            )
        }),
    ]
    .boxed()
}

fn total_length(spec: &LayoutSpec) -> u64 {
    spec.clone()
        .with_servers(0, SERVERS - 1)
        .build(SERVERS + 1)
        .expect("generated layouts are valid")
        .total_length()
}

impl ReferenceStateMachine for BufferRefState {
    type State = Self;
    type Transition = Transition;

    fn init_state() -> BoxedStrategy<Self::State> {
        layout_strategy()
            .prop_map(|spec| {
                let total = total_length(&spec) as usize;
                Self {
                    spec,
                    bytes: vec![0; total],
                }
            })
            .boxed()
    }

    fn transitions(state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let total = state.bytes.len();
        let put = (0..total, prop::collection::vec(any::<u8>(), 1..MAX_TRANSFER))
            .prop_map(move |(address, mut data)| {
                data.truncate(total - address);
                Transition::Put {
                    address: address as u64,
                    data,
                }
            });
        let get = (0..total, 1..MAX_TRANSFER).prop_map(move |(address, length)| Transition::Get {
            address: address as u64,
            length: length.min(total - address),
        });
        prop_oneof![put, get].boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        if let Transition::Put { address, data } = transition {
            let start = *address as usize;
            state.bytes[start..start + data.len()].copy_from_slice(data);
        }
        state
    }
}

/// System under test - an in-process cluster with one worker
pub struct DsmClusterTest {
    client: Option<DsmBuffer>,
    servers: Option<Servers>,
}

impl StateMachineTest for DsmClusterTest {
    type SystemUnderTest = Self;
    type Reference = BufferRefState;

    fn init_test(
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        let (mut clients, servers) = start_cluster(ref_state.spec.clone(), SERVERS, 1);
        Self {
            client: clients.pop(),
            servers: Some(servers),
        }
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        let client = state.client.as_mut().expect("cluster is running");
        match transition {
            Transition::Put { address, data } => {
                client.put(address, &data).expect("put inside the buffer");
            }
            Transition::Get { address, length } => {
                let mut out = vec![0u8; length];
                client.get(address, &mut out).expect("get inside the buffer");
                let start = address as usize;
                assert_eq!(
                    out,
                    &ref_state.bytes[start..start + length],
                    "Get mismatch at {} (+{})",
                    address,
                    length
                );
            }
        }
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        let client = state.client.as_ref().expect("cluster is running");
        assert_eq!(
            client.total_length().unwrap(),
            ref_state.bytes.len() as u64
        );
    }

    fn teardown(mut state: Self::SystemUnderTest) {
        if let (Some(client), Some(servers)) = (state.client.take(), state.servers.take()) {
            for result in stop_cluster(vec![client], servers) {
                result.expect("service loop ended cleanly");
            }
        }
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 24,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    #[test]
    fn pbt_put_get_matches_flat_buffer(
        sequential 1..30 => DsmClusterTest
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_put_overwrites() {
        let mut state = BufferRefState {
            spec: LayoutSpec::uniform(LENGTH),
            bytes: vec![0; 16],
        };
        state = BufferRefState::apply(
            state,
            &Transition::Put {
                address: 4,
                data: b"abcd".to_vec(),
            },
        );
        state = BufferRefState::apply(
            state,
            &Transition::Put {
                address: 6,
                data: b"XY".to_vec(),
            },
        );
        assert_eq!(&state.bytes[4..8], b"abXY");
    }

    #[test]
    fn test_reference_totals() {
        assert_eq!(total_length(&LayoutSpec::uniform(LENGTH)), 3 * LENGTH);
        assert_eq!(
            total_length(&LayoutSpec::block_cyclic(LENGTH, BLOCK)),
            3 * LENGTH
        );
        let mixed = LayoutSpec::mixed(vec![
            MixedExtent { rank: 2, length: 10 },
            MixedExtent { rank: 0, length: 5 },
        ]);
        assert_eq!(total_length(&mixed), 15);
    }
}
