//! Exercises the verbose logging path end to end, so `tracing-subscriber`
//! stays a genuinely used dev-dependency rather than a declared-but-idle one.

use std::sync::Arc;

use hpmap::context::{LocalContext, ParallelContext};
use hpmap::dist_range::DistRange;
use hpmap::reducer::Sum;

#[test]
fn verbose_mapreduce_emits_tracing_events() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let ctx: Arc<dyn ParallelContext> = Arc::new(LocalContext::with_threads(2));
    let dst = DistRange::new(0, 200)
        .mapreduce::<i64, i64, _, _>(ctx, |i, emit| emit(i % 5, i), Sum, true)
        .unwrap();

    assert_eq!(dst.n_keys().unwrap(), 5);
}
