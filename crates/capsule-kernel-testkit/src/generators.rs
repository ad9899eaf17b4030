//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::{json, Value};

use capsule_kernel_caps::{ResourceType, Rights};
use capsule_kernel_core::{ExecutionTrace, Keypair, ProofBuilder, ProofObject};

/// Generate a random keypair.
pub fn keypair() -> impl Strategy<Value = Keypair> {
    any::<[u8; 32]>().prop_map(|seed| Keypair::from_seed(&seed))
}

/// Generate a reasonable timestamp.
pub fn timestamp() -> impl Strategy<Value = i64> {
    0i64..=4_102_444_800_000 // 2100-01-01
}

/// One path segment such as `accrual`.
pub fn segment() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,7}".prop_map(String::from)
}

/// A dotted resource path such as `accrual.calculate`.
pub fn resource_path() -> impl Strategy<Value = String> {
    prop::collection::vec(segment(), 1..=3).prop_map(|parts| parts.join("."))
}

/// A glob over dotted paths: literal segments, `*` tails and `?` holes.
pub fn resource_pattern() -> impl Strategy<Value = String> {
    prop_oneof![
        resource_path(),
        resource_path().prop_map(|p| format!("{p}.*")),
        resource_path().prop_map(|p| format!("{p}*")),
        Just("*".to_string()),
        resource_path().prop_map(|p| {
            let mut chars: Vec<char> = p.chars().collect();
            chars[0] = '?';
            chars.into_iter().collect()
        }),
    ]
}

pub fn resource_type() -> impl Strategy<Value = ResourceType> {
    prop_oneof![
        Just(ResourceType::Channel),
        Just(ResourceType::Mailbox),
        Just(ResourceType::Storage),
        Just(ResourceType::Network),
        Just(ResourceType::Clock),
        Just(ResourceType::AuditLog),
        Just(ResourceType::Module),
        segment().prop_map(ResourceType::Custom),
    ]
}

pub fn rights() -> impl Strategy<Value = Rights> {
    any::<[bool; 5]>().prop_map(|[read, write, execute, delegate, revoke]| Rights {
        read,
        write,
        execute,
        delegate,
        revoke,
    })
}

/// A JSON object of numbers and short strings.
pub fn flat_object() -> impl Strategy<Value = Value> {
    prop::collection::btree_map(
        "[a-zA-Z]{1,8}",
        prop_oneof![
            any::<i32>().prop_map(|n| json!(n)),
            (0u32..100_000).prop_map(|n| json!(f64::from(n) / 100.0)),
            "[a-z ]{0,12}".prop_map(|s| json!(s)),
            any::<bool>().prop_map(|b| json!(b)),
        ],
        0..6,
    )
    .prop_map(|m| Value::Object(m.into_iter().collect()))
}

/// Parameters for sealing a proof.
#[derive(Debug, Clone)]
pub struct ProofParams {
    pub operation: String,
    pub inputs: Value,
    pub outputs: Value,
    pub timestamp: i64,
    pub statute_refs: Vec<String>,
}

impl Arbitrary for ProofParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            resource_path(),
            flat_object(),
            flat_object(),
            timestamp(),
            prop::collection::vec("[A-Z][a-z]{2,8} §[0-9]{1,2}", 0..3),
        )
            .prop_map(|(operation, inputs, outputs, timestamp, statute_refs)| ProofParams {
                operation,
                inputs,
                outputs,
                timestamp,
                statute_refs,
            })
            .boxed()
    }
}

/// Seal a proof from parameters with an empty trace.
pub fn proof_from_params(params: &ProofParams) -> ProofObject {
    ProofBuilder::new(&params.operation)
        .inputs(&params.inputs)
        .outputs(&params.outputs)
        .trace(ExecutionTrace::empty())
        .statute_refs(params.statute_refs.iter().cloned())
        .timestamp(params.timestamp)
        .seal()
        .expect("generated proof params are valid")
}
