//! Property tests over the kernel's security and ordering guarantees.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use capsule_kernel::caps::{CapabilityEngine, CapabilitySpec, ResourcePattern, ResourceType, Rights};
use capsule_kernel::core::ManualClock;
use capsule_kernel::ipc::{Message, OverflowPolicy, Router};
use capsule_kernel::sched::ProcessId;
use capsule_kernel_testkit::generators::{resource_path, resource_pattern, resource_type, rights};

proptest! {
    /// A check passes exactly when type, pattern and rights all line up.
    #[test]
    fn test_capability_soundness(
        held_type in resource_type(),
        pattern in resource_pattern(),
        held in rights(),
        asked_type in resource_type(),
        path in resource_path(),
        required in rights(),
    ) {
        let engine = CapabilityEngine::new(Arc::new(ManualClock::new(0)));
        let token = engine
            .issue(CapabilitySpec::new(held_type.clone(), pattern.clone(), held))
            .unwrap();

        let expected = held_type == asked_type
            && ResourcePattern::new(&pattern).unwrap().matches(&path)
            && required.is_subset_of(&held);
        prop_assert_eq!(engine.validate(&token, &asked_type, &path, required), expected);
    }

    /// A use-limited capability succeeds exactly `max_uses` times.
    #[test]
    fn test_use_limit_is_exact(max_uses in 1u64..8, attempts in 1usize..16) {
        let engine = CapabilityEngine::new(Arc::new(ManualClock::new(0)));
        let token = engine
            .issue(CapabilitySpec::new(ResourceType::Storage, "ledger.*", Rights::read_only()).max_uses(max_uses))
            .unwrap();

        let ok = (0..attempts)
            .filter(|_| engine.validate(&token, &ResourceType::Storage, "ledger.a", Rights::read_only()))
            .count();
        prop_assert_eq!(ok as u64, max_uses.min(attempts as u64));
    }

    /// Messages on one channel are delivered in send order with rising
    /// sequence numbers, however the senders interleave.
    #[test]
    fn test_per_channel_fifo(order in prop::collection::vec(0u8..3, 1..40)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
        rt.block_on(async {
            let clock = Arc::new(ManualClock::new(0));
            let engine = Arc::new(CapabilityEngine::new(clock.clone()));
            let router = Router::new(engine.clone(), clock, Duration::from_millis(10));
            let target = ProcessId(100);
            router.register_mailbox(target, "inbox", 64, OverflowPolicy::BlockSender).unwrap();
            let token = engine
                .issue(CapabilitySpec::new(ResourceType::Mailbox, "inbox", Rights::write_only()))
                .unwrap();

            let mut sent = [0u64; 3];
            for &s in &order {
                sent[s as usize] += 1;
                let body = sent[s as usize].to_string();
                router
                    .send(&token, Message::new(ProcessId(u64::from(s) + 1), target, "n", body))
                    .await
                    .unwrap();
            }

            let mut last = [0u64; 3];
            while let Some(msg) = router.receive(target, 0, None).await.unwrap().into_message() {
                let s = (msg.header.source.0 - 1) as usize;
                let n: u64 = std::str::from_utf8(&msg.payload).unwrap().parse().unwrap();
                assert_eq!(n, last[s] + 1);
                assert_eq!(msg.header.sequence, n);
                last[s] = n;
            }
            assert_eq!(last, sent);
        });
    }
}
