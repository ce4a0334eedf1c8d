//! Reads match regardless of how the peer fragments its writes.

use std::sync::Arc;

use proptest::prelude::*;
use wirescript_core::{ast::Location, prepare_script};
use wirescript_harness::{SimProvider, peer};

fn fragments(payload: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut points: Vec<usize> = cuts.iter().map(|cut| cut % (payload.len() + 1)).collect();
    points.push(0);
    points.push(payload.len());
    points.sort_unstable();
    points.dedup();
    points.windows(2).map(|pair| payload[pair[0]..pair[1]].to_vec()).collect()
}

fn run_fragmented(payload: &str, chunks: Vec<Vec<u8>>) -> bool {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    runtime.block_on(async move {
        let sim = SimProvider::new();
        let script = format!("accept \"tcp://localhost:9700\"\nread \"{payload}\"\nwrite \"ok\"\n");
        let run = prepare_script(&script, Arc::new(sim.clone())).await.unwrap();
        run.start();

        let mut io = sim.dial(&Location::parse("tcp://localhost:9700").unwrap()).unwrap();
        for chunk in chunks {
            peer::send(&mut io, &chunk).await.unwrap();
            tokio::task::yield_now().await;
        }
        peer::expect(&mut io, b"ok").await.unwrap();
        run.finished().await.is_success()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn fragmented_payload_matches(
        payload in "[a-z0-9]{1,24}",
        cuts in prop::collection::vec(any::<usize>(), 0..6),
    ) {
        let chunks = fragments(payload.as_bytes(), &cuts);
        prop_assert_eq!(chunks.concat(), payload.as_bytes().to_vec());
        prop_assert!(run_fragmented(&payload, chunks));
    }
}
