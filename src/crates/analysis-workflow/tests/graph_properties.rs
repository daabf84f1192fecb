//! Property tests for workflow graph validation

use analysis_workflow::step::step_fn;
use analysis_workflow::{Router, Step, StepAction, StepConfig, StepOutput, WorkflowGraph};
use proptest::prelude::*;
use std::sync::Arc;

fn noop() -> Arc<dyn Step> {
    Arc::new(step_fn(|_ctx, _state| {
        Box::pin(async move { Ok(StepAction::complete(StepOutput::Custom("ok".into()))) })
    }))
}

fn name(i: usize) -> String {
    format!("s{}", i)
}

/// Linear chain s0 -> s1 -> ... with the given target percentages
fn chain(percents: &[u8]) -> WorkflowGraph {
    let mut graph = WorkflowGraph::new();
    for (i, pct) in percents.iter().enumerate() {
        let mut config = StepConfig::new(name(i), *pct);
        if i > 0 {
            config = config.requires(name(i - 1), 1);
        }
        graph.register_step(config, noop());
        if i > 0 {
            graph.add_edge(name(i - 1), name(i));
        }
    }
    graph.set_entry(name(0)).set_finish(name(percents.len() - 1));
    graph
}

proptest! {
    #[test]
    fn chain_valid_iff_progress_strictly_increases(percents in prop::collection::vec(1u8..=100, 2..8)) {
        let increasing = percents.windows(2).all(|w| w[0] < w[1]);
        prop_assert_eq!(chain(&percents).validate().is_ok(), increasing);
    }

    #[test]
    fn backward_edge_is_rejected(len in 3usize..8, from_offset in 1usize..7, to in 0usize..6) {
        let percents: Vec<u8> = (0..len).map(|i| (i as u8 + 1) * 10).collect();
        let from = (from_offset % (len - 1)).max(1);
        let to = to % from;

        let mut graph = WorkflowGraph::new();
        for (i, pct) in percents.iter().enumerate() {
            graph.register_step(StepConfig::new(name(i), *pct), noop());
        }
        for i in 1..len {
            // step `from` loops back instead of moving on
            if i - 1 == from {
                graph.add_edge(name(from), name(to));
            } else {
                graph.add_edge(name(i - 1), name(i));
            }
        }
        graph.set_entry(name(0)).set_finish(name(len - 1));
        prop_assert!(graph.validate().is_err());
    }

    #[test]
    fn router_labels_must_all_be_mapped(labels in prop::collection::btree_set("[a-z]{1,6}", 1..5), drop_one in any::<bool>()) {
        let labels: Vec<String> = labels.into_iter().collect();
        let mut graph = WorkflowGraph::new();
        graph
            .register_step(StepConfig::new("start", 5), noop())
            .register_step(StepConfig::new("end", 100), noop());

        let first = labels[0].clone();
        let router = Router::new(labels.clone(), move |_state| first.clone());
        let mapped = if drop_one { &labels[1..] } else { &labels[..] };
        graph
            .add_conditional_edges("start", Some(router), mapped.iter().map(|l| (l.clone(), "end")))
            .set_entry("start")
            .set_finish("end");

        prop_assert_eq!(graph.validate().is_ok(), !drop_one);
    }

    #[test]
    fn requirement_on_unknown_step_is_rejected(len in 2usize..7, at in 0usize..6) {
        let at = at % len;
        let mut graph = WorkflowGraph::new();
        for i in 0..len {
            let mut config = StepConfig::new(name(i), (i as u8 + 1) * 10);
            if i == at {
                config = config.requires("ghost", 1);
            }
            graph.register_step(config, noop());
            if i > 0 {
                graph.add_edge(name(i - 1), name(i));
            }
        }
        graph.set_entry(name(0)).set_finish(name(len - 1));
        prop_assert!(graph.validate().is_err());
    }
}
