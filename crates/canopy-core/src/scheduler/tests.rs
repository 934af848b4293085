use super::*;
use crate::engine::{ExecutionEngine, ReferenceEngine};

const VOCAB: u32 = 1000;

fn config(max_total_tokens: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_total_tokens,
        random_seed: Some(0),
        ..Default::default()
    }
}

fn greedy(max_new_tokens: usize) -> SamplingParams {
    SamplingParams::greedy().with_max_new_tokens(max_new_tokens)
}

fn submit(s: &mut Scheduler, input: &[u32], max_new_tokens: usize) -> RequestId {
    s.submit(SubmitRequest::new(input.to_vec()).with_sampling(greedy(max_new_tokens)))
        .unwrap()
}

/// Run one tick against the engine.
async fn step(s: &mut Scheduler, engine: &ReferenceEngine) -> Option<BatchPlan> {
    let plan = s.schedule().unwrap()?;
    let sampled = engine.run(&plan).await.unwrap();
    s.process_output(&plan, sampled).unwrap();
    Some(plan)
}

/// Tick until no request is left, collecting events.
async fn run_to_idle(s: &mut Scheduler, engine: &ReferenceEngine) -> Vec<RequestEvent> {
    let mut events = Vec::new();
    for _ in 0..10_000 {
        if s.is_idle() {
            return events;
        }
        step(s, engine).await;
        events.extend(s.take_events());
    }
    panic!("scheduler did not drain: {:?}", s.stats());
}

fn tokens_of(events: &[RequestEvent], id: RequestId, index: usize) -> Vec<u32> {
    events
        .iter()
        .filter(|e| e.request_id == id && e.index == index)
        .filter_map(RequestEvent::token_id)
        .collect()
}

fn finish_of(events: &[RequestEvent], id: RequestId) -> Option<&EventKind> {
    events
        .iter()
        .find(|e| e.request_id == id && e.is_terminal())
        .map(|e| &e.kind)
}

/// Commit `tokens` straight into the prefix cache.
fn seed_tree(s: &mut Scheduler, tokens: &[u32]) {
    let slots = s.pool.alloc(tokens.len()).unwrap();
    let rejected = s.tree.insert(tokens, &slots).unwrap();
    s.pool.free(&rejected).unwrap();
}

#[test]
fn rejects_invalid_submissions() {
    let mut s = Scheduler::new(SchedulerConfig {
        context_length: Some(8),
        ..config(6)
    })
    .unwrap();

    let empty = s.submit(SubmitRequest::new(vec![]));
    assert!(matches!(empty, Err(CanopyError::AdmissionRejected(_))));

    let bad_sampling = s.submit(SubmitRequest::new(vec![1]).with_sampling(SamplingParams {
        top_p: 0.0,
        ..Default::default()
    }));
    assert!(matches!(bad_sampling, Err(CanopyError::AdmissionRejected(_))));

    let too_long_context = s.submit(SubmitRequest::new(vec![1, 2, 3]).with_sampling(greedy(6)));
    assert!(matches!(too_long_context, Err(CanopyError::AdmissionRejected(_))));

    // Six slots hold at most a five-token prompt plus its first sampled token.
    let too_long_pool = s.submit(SubmitRequest::new(vec![1; 6]).with_sampling(greedy(1)));
    assert!(matches!(too_long_pool, Err(CanopyError::AdmissionRejected(_))));
    assert!(s.submit(SubmitRequest::new(vec![1; 5]).with_sampling(greedy(1))).is_ok());

    let id = RequestId::new();
    let mut first = SubmitRequest::new(vec![1]).with_sampling(greedy(1));
    first.request_id = id;
    s.submit(first.clone()).unwrap();
    assert!(matches!(s.submit(first), Err(CanopyError::AdmissionRejected(_))));

    assert_eq!(s.num_waiting(), 2);
}

#[test]
fn invalid_config_is_rejected() {
    let result = Scheduler::new(SchedulerConfig {
        max_running_requests: 0,
        ..Default::default()
    });
    assert!(matches!(result, Err(CanopyError::InvalidConfig(_))));
}

#[tokio::test]
async fn single_request_runs_to_length() {
    let engine = ReferenceEngine::new(VOCAB);
    let mut s = Scheduler::new(config(32)).unwrap();
    let id = submit(&mut s, &[1, 2, 3], 4);

    let first = s.schedule().unwrap().unwrap();
    assert_eq!(first.batch_type(), Some(BatchType::Prefill));
    assert_eq!(first.prefill[0].tokens, vec![1, 2, 3]);
    assert_eq!(first.prefill[0].cached_len, 0);
    let sampled = engine.run(&first).await.unwrap();
    s.process_output(&first, sampled).unwrap();

    let req = s.request(id).unwrap();
    assert_eq!(req.state, RequestState::Running);
    assert_eq!(req.output_ids, vec![engine.next_token(&[1, 2, 3])]);
    assert_eq!(req.owned_slots.len(), 4);

    let events = run_to_idle(&mut s, &engine).await;
    let mut all = s.take_events();
    all.extend(events);

    assert!(matches!(
        finish_of(&all, id),
        Some(EventKind::Finish {
            reason: FinishReason::Length,
            prompt_tokens: 3,
            completion_tokens: 4,
            cached_tokens: 0,
        })
    ));
    // The final token never got KV; everything else is cached.
    assert_eq!(s.tree().total_slots(), 6);
    assert_eq!(s.pool().available(), 32 - 6);
    assert_eq!(s.stats().finished, 1);
    s.check_invariants().unwrap();
}

#[tokio::test]
async fn prefix_is_reused_after_completion() {
    let engine = ReferenceEngine::new(VOCAB);
    let mut s = Scheduler::new(config(64)).unwrap();

    submit(&mut s, &[1, 2, 3, 4, 5], 1);
    run_to_idle(&mut s, &engine).await;
    assert_eq!(s.tree().total_slots(), 5);

    let b = submit(&mut s, &[1, 2, 3, 9, 9], 1);
    let plan = s.schedule().unwrap().unwrap();
    let req = s.request(b).unwrap();
    assert_eq!(req.prefix_indices.len(), 3);
    assert_eq!(req.kv_need(), 2);
    assert_eq!(plan.prefill[0].cached_len, 3);
    assert_eq!(plan.num_prefill_tokens(), 2);
    assert_eq!(s.stats().cache_hit_tokens, 3);

    // The engine verifies the reused slots hold tokens 1, 2, 3.
    let sampled = engine.run(&plan).await.unwrap();
    s.process_output(&plan, sampled).unwrap();
    s.check_invariants().unwrap();
}

#[tokio::test]
async fn admission_evicts_lru_leaves() {
    let engine = ReferenceEngine::new(VOCAB);
    let mut s = Scheduler::new(config(10)).unwrap();
    seed_tree(&mut s, &[100, 101, 102, 103]);
    seed_tree(&mut s, &[200, 201, 202, 203, 204, 205]);
    // Touch the older leaf so the six-slot leaf becomes the LRU one.
    s.tree.match_prefix(&[100, 101, 102, 103]);
    assert_eq!(s.pool().available(), 0);

    let id = submit(&mut s, &[1, 2, 3, 4, 5], 1);
    let plan = step(&mut s, &engine).await.unwrap();

    assert_eq!(plan.prefill.len(), 1);
    assert_eq!(plan.prefill[0].id, id);
    assert_eq!(s.stats().evicted_slots, 6);
    assert_eq!(s.tree.match_prefix(&[100, 101, 102, 103]).len(), 4);
    s.check_invariants().unwrap();
}

#[tokio::test]
async fn blocked_admission_keeps_request_waiting() {
    let engine = ReferenceEngine::new(VOCAB);
    let mut s = Scheduler::new(SchedulerConfig {
        disable_radix_cache: true,
        ..config(8)
    })
    .unwrap();

    let a = submit(&mut s, &[1, 2, 3, 4], 3);
    step(&mut s, &engine).await.unwrap();
    let b = submit(&mut s, &[5, 6, 7], 1);

    // A holds five slots and reserves one; B needs four.
    let plan = step(&mut s, &engine).await.unwrap();
    assert!(plan.prefill.is_empty());
    assert_eq!(s.request(b).unwrap().state, RequestState::Waiting);
    assert_eq!(s.request(b).unwrap().eviction_failures, 1);

    run_to_idle(&mut s, &engine).await;
    assert!(s.request(a).is_none());
    assert!(s.request(b).is_none());
    assert_eq!(s.pool().available(), 8);
}

#[tokio::test]
async fn decode_pressure_retracts_newest_request() {
    let engine = ReferenceEngine::new(VOCAB);
    let mut s = Scheduler::new(SchedulerConfig {
        disable_radix_cache: true,
        max_running_requests: 2,
        ..config(12)
    })
    .unwrap();

    let a = submit(&mut s, &[1, 2, 3, 4], 8);
    let b = submit(&mut s, &[5, 6, 7, 8], 8);

    let first = step(&mut s, &engine).await.unwrap();
    assert_eq!(first.prefill.len(), 2);
    step(&mut s, &engine).await.unwrap();
    assert_eq!(s.pool().available(), 0);

    // Both own six slots; B was admitted last.
    let third = step(&mut s, &engine).await.unwrap();
    assert_eq!(third.decode.len(), 1);
    assert_eq!(third.decode[0].id, a);
    assert!(third.prefill.is_empty());

    let retracted = s.request(b).unwrap();
    assert_eq!(retracted.state, RequestState::Retracted);
    assert_eq!(retracted.output_ids.len(), 2);
    assert!(retracted.owned_slots.is_empty());
    assert_eq!(s.stats().retractions, 1);
    s.check_invariants().unwrap();

    let events = run_to_idle(&mut s, &engine).await;
    assert!(matches!(
        finish_of(&events, b),
        Some(EventKind::Finish {
            reason: FinishReason::Length,
            completion_tokens: 8,
            ..
        })
    ));
}

#[tokio::test]
async fn retraction_does_not_change_outputs() {
    let engine = ReferenceEngine::new(VOCAB);
    let prompts: [&[u32]; 2] = [&[1, 2, 3, 4], &[5, 6, 7, 8]];

    let mut outputs = Vec::new();
    for max_total_tokens in [12, 64] {
        let mut s = Scheduler::new(SchedulerConfig {
            disable_radix_cache: true,
            max_running_requests: 2,
            ..config(max_total_tokens)
        })
        .unwrap();
        let mut ids = Vec::new();
        let mut events = s.take_events();
        for prompt in prompts {
            ids.push(submit(&mut s, prompt, 8));
        }
        events.extend(run_to_idle(&mut s, &engine).await);
        let retractions = s.stats().retractions;
        outputs.push((
            ids.iter().map(|id| tokens_of(&events, *id, 0)).collect::<Vec<_>>(),
            retractions,
        ));
    }

    assert_eq!(outputs[0].1, 1);
    assert_eq!(outputs[1].1, 0);
    assert_eq!(outputs[0].0, outputs[1].0);
    assert!(outputs[0].0.iter().all(|t| t.len() == 8));
}

#[tokio::test]
async fn running_requests_are_never_preempted_by_priority() {
    let engine = ReferenceEngine::new(VOCAB);
    let mut s = Scheduler::new(SchedulerConfig {
        max_running_requests: 1,
        ..config(64)
    })
    .unwrap();
    seed_tree(&mut s, &[7, 7, 7, 7, 7, 7]);

    let a = submit(&mut s, &[1, 2], 4);
    step(&mut s, &engine).await.unwrap();
    let b = submit(&mut s, &[7, 7, 7, 7, 7, 7, 1], 4);

    let plan = step(&mut s, &engine).await.unwrap();
    assert!(plan.prefill.is_empty());
    assert_eq!(plan.decode[0].id, a);
    let waiting = s.request(b).unwrap();
    assert_eq!(waiting.prefix_indices.len(), 6);
    assert_eq!(waiting.state, RequestState::Waiting);
}

#[tokio::test]
async fn oversized_prompt_is_admitted_alone() {
    let engine = ReferenceEngine::new(VOCAB);
    let cfg = SchedulerConfig {
        max_prefill_tokens: 4,
        schedule_heuristic: SchedulePolicy::Fcfs,
        ..config(64)
    };

    // Oversized first: admitted alone with the budget relaxed.
    let mut s = Scheduler::new(cfg.clone()).unwrap();
    let big = submit(&mut s, &[1; 10], 2);
    let small = submit(&mut s, &[2, 3], 2);
    let plan = step(&mut s, &engine).await.unwrap();
    assert_eq!(plan.prefill.len(), 1);
    assert_eq!(plan.prefill[0].id, big);
    assert_eq!(plan.num_prefill_tokens(), 10);
    let plan = step(&mut s, &engine).await.unwrap();
    assert_eq!(plan.prefill[0].id, small);

    // Oversized second: waits for the next tick, which it then leads.
    let mut s = Scheduler::new(cfg).unwrap();
    let small = submit(&mut s, &[2, 3], 2);
    let big = submit(&mut s, &[1; 10], 2);
    let plan = step(&mut s, &engine).await.unwrap();
    assert_eq!(plan.prefill.len(), 1);
    assert_eq!(plan.prefill[0].id, small);
    let plan = step(&mut s, &engine).await.unwrap();
    assert_eq!(plan.prefill.len(), 1);
    assert_eq!(plan.prefill[0].id, big);
    assert_eq!(plan.decode.len(), 1);
}

#[test]
fn prefill_budget_limits_admission() {
    let mut s = Scheduler::new(SchedulerConfig {
        max_prefill_tokens: 8,
        schedule_conservativeness: 2.0,
        schedule_heuristic: SchedulePolicy::Fcfs,
        ..config(64)
    })
    .unwrap();
    for i in 0..3 {
        submit(&mut s, &[i, i], 1);
    }

    // Budget is 8 / 2 = 4 tokens: two prompts of two.
    let plan = s.schedule().unwrap().unwrap();
    assert_eq!(plan.prefill.len(), 2);
    assert_eq!(s.num_waiting(), 1);
}

#[test]
fn fcfs_and_lpm_admission_order() {
    for (policy, expected) in [
        (SchedulePolicy::Fcfs, [0, 1, 2]),
        (SchedulePolicy::Lpm, [1, 2, 0]),
    ] {
        let mut s = Scheduler::new(SchedulerConfig {
            schedule_heuristic: policy,
            ..config(64)
        })
        .unwrap();
        seed_tree(&mut s, &[1, 2, 3, 4, 5, 6]);

        let ids = [
            submit(&mut s, &[9, 9, 9], 1),
            submit(&mut s, &[1, 2, 3, 4, 5, 7], 1),
            submit(&mut s, &[1, 2, 8], 1),
        ];
        let plan = s.schedule().unwrap().unwrap();
        let order: Vec<RequestId> = plan.prefill.iter().map(|r| r.id).collect();
        assert_eq!(order, expected.map(|i| ids[i]).to_vec(), "{policy}");
        assert_eq!(plan.prefill[1].cached_len, if policy == SchedulePolicy::Lpm { 2 } else { 5 });
    }
}

#[tokio::test]
async fn lpm_without_cache_matches_fcfs() {
    let engine = ReferenceEngine::new(VOCAB);
    let mut traces = Vec::new();
    for policy in [SchedulePolicy::Lpm, SchedulePolicy::Fcfs] {
        let mut s = Scheduler::new(SchedulerConfig {
            disable_radix_cache: true,
            schedule_heuristic: policy,
            max_prefill_tokens: 6,
            ..config(40)
        })
        .unwrap();
        assert_eq!(s.prioritizer.policy(), SchedulePolicy::Fcfs);

        for prompt in [&[1, 2, 3][..], &[1, 2, 3, 4], &[5], &[1, 2, 3, 4, 5]] {
            submit(&mut s, prompt, 3);
        }
        let mut trace = Vec::new();
        while !s.is_idle() {
            if let Some(plan) = step(&mut s, &engine).await {
                let prefill: Vec<Vec<u32>> = plan.prefill.iter().map(|r| r.tokens.clone()).collect();
                trace.push(prefill);
            }
        }
        traces.push(trace);
    }
    assert_eq!(traces[0], traces[1]);
}

#[test]
fn dfs_weight_admits_heavier_subtree_first() {
    let mut s = Scheduler::new(SchedulerConfig {
        schedule_heuristic: SchedulePolicy::DfsWeight,
        ..config(128)
    })
    .unwrap();
    seed_tree(&mut s, &[9, 9]);
    seed_tree(&mut s, &[1, 2]);
    seed_tree(&mut s, &[1, 2, 3, 4]);

    let a1 = submit(&mut s, &[1, 2, 50], 1);
    let c1 = submit(&mut s, &[9, 9, 50], 1);
    let b1 = submit(&mut s, &[1, 2, 3, 4, 50], 1);
    let c2 = submit(&mut s, &[9, 9, 51], 1);
    let a2 = submit(&mut s, &[1, 2, 51], 1);
    let c3 = submit(&mut s, &[9, 9, 52], 1);

    let plan = s.schedule().unwrap().unwrap();
    let order: Vec<RequestId> = plan.prefill.iter().map(|r| r.id).collect();
    assert_eq!(order, vec![c1, c2, c3, b1, a1, a2]);
}

#[tokio::test]
async fn abort_running_request_commits_computed_prefix() {
    let engine = ReferenceEngine::new(VOCAB);
    let mut s = Scheduler::new(config(32)).unwrap();
    let id = submit(&mut s, &[1, 2, 3, 4], 10);

    step(&mut s, &engine).await.unwrap();
    step(&mut s, &engine).await.unwrap();
    s.take_events();
    assert_eq!(s.request(id).unwrap().output_ids.len(), 2);

    s.abort(id).unwrap();
    assert!(s.schedule().unwrap().is_none());

    let events = s.take_events();
    assert!(matches!(
        finish_of(&events, id),
        Some(EventKind::Finish {
            reason: FinishReason::Abort,
            completion_tokens: 2,
            ..
        })
    ));
    // Input plus the first output token had KV computed.
    assert_eq!(s.tree().total_slots(), 5);
    assert_eq!(s.pool().available(), 32 - 5);
    assert_eq!(s.stats().aborted, 1);
    assert!(s.is_idle());
}

#[test]
fn abort_waiting_request_frees_nothing() {
    let mut s = Scheduler::new(config(16)).unwrap();
    let id = submit(&mut s, &[1, 2, 3], 4);

    s.abort(id).unwrap();
    assert!(s.schedule().unwrap().is_none());
    assert_eq!(s.pool().available(), 16);
    assert!(matches!(
        s.take_events()[0].kind,
        EventKind::Finish {
            reason: FinishReason::Abort,
            completion_tokens: 0,
            ..
        }
    ));

    assert!(matches!(
        s.abort(RequestId::new()),
        Err(CanopyError::UnknownRequest(_))
    ));
}

#[tokio::test]
async fn parallel_samples_share_the_submitted_id() {
    let engine = ReferenceEngine::new(VOCAB);
    let mut s = Scheduler::new(config(64)).unwrap();
    let id = s
        .submit(SubmitRequest::new(vec![4, 5, 6]).with_sampling(SamplingParams {
            n: 3,
            ..greedy(2)
        }))
        .unwrap();
    assert_eq!(s.num_waiting(), 3);

    let events = run_to_idle(&mut s, &engine).await;
    for index in 0..3 {
        assert_eq!(tokens_of(&events, id, index).len(), 2);
    }
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 3);
    assert!(events.iter().all(|e| e.request_id == id));
}

#[tokio::test]
async fn abort_group_cancels_every_sample() {
    let engine = ReferenceEngine::new(VOCAB);
    let mut s = Scheduler::new(config(64)).unwrap();
    let id = s
        .submit(SubmitRequest::new(vec![4, 5, 6]).with_sampling(SamplingParams {
            n: 2,
            ..greedy(8)
        }))
        .unwrap();
    step(&mut s, &engine).await.unwrap();

    s.abort(id).unwrap();
    s.schedule().unwrap();
    let aborted = s
        .take_events()
        .into_iter()
        .filter(|e| e.finish_reason() == Some(FinishReason::Abort))
        .count();
    assert_eq!(aborted, 2);
    assert!(s.is_idle());
}

#[tokio::test]
async fn eos_finishes_unless_ignored() {
    let probe = ReferenceEngine::new(VOCAB);
    let eos = probe.next_token(&[1, 2, 3]);
    let engine = ReferenceEngine::new(VOCAB).with_eos(eos);

    let mut s = Scheduler::new(config(64)).unwrap();
    s.set_eos_token_id(engine.eos_token_id());
    let stops = submit(&mut s, &[1, 2, 3], 8);
    let ignores = s
        .submit(SubmitRequest::new(vec![1, 2, 3]).with_sampling(SamplingParams {
            ignore_eos: true,
            ..greedy(3)
        }))
        .unwrap();

    let events = run_to_idle(&mut s, &engine).await;
    assert!(matches!(
        finish_of(&events, stops),
        Some(EventKind::Finish {
            reason: FinishReason::Eos,
            completion_tokens: 1,
            ..
        })
    ));
    assert_eq!(tokens_of(&events, ignores, 0).len(), 3);
}

#[tokio::test]
async fn stop_string_finishes_request() {
    let probe = ReferenceEngine::new(VOCAB);
    let first = probe.next_token(&[1, 2, 3]);
    let engine = ReferenceEngine::new(VOCAB).with_token_text(first, "done.\n");

    let mut s = Scheduler::new(config(64)).unwrap();
    let id = s
        .submit(SubmitRequest::new(vec![1, 2, 3]).with_sampling(SamplingParams {
            stop: StopStrings::One("\n".into()),
            ..greedy(8)
        }))
        .unwrap();

    let events = run_to_idle(&mut s, &engine).await;
    assert!(matches!(
        finish_of(&events, id),
        Some(EventKind::Finish {
            reason: FinishReason::Stop,
            ..
        })
    ));
    assert!(matches!(
        &events[0].kind,
        EventKind::Token { text: Some(t), .. } if t == "done.\n"
    ));
}

#[tokio::test]
async fn jump_forward_commits_forced_tokens() {
    let engine = ReferenceEngine::new(VOCAB).with_jump_forward(vec![7, 8, 9]);
    let regex = SamplingParams {
        regex: Some("[0-9]+".into()),
        ..greedy(16)
    };

    let mut s = Scheduler::new(config(64)).unwrap();
    let id = s
        .submit(SubmitRequest::new(vec![1, 2, 3]).with_sampling(regex.clone()))
        .unwrap();
    step(&mut s, &engine).await.unwrap();

    let t1 = engine.next_token(&[1, 2, 3]);
    let req = s.request(id).unwrap();
    assert_eq!(req.output_ids, vec![t1, 7, 8, 9]);
    assert_eq!(req.owned_slots.len(), 7);

    let plan = step(&mut s, &engine).await.unwrap();
    assert_eq!(plan.decode[0].new_tokens(), &[t1, 7, 8, 9]);

    // Jump forward turned off: only sampled tokens.
    let mut s = Scheduler::new(SchedulerConfig {
        disable_regex_jump_forward: true,
        ..config(64)
    })
    .unwrap();
    let id = s.submit(SubmitRequest::new(vec![1, 2, 3]).with_sampling(regex)).unwrap();
    step(&mut s, &engine).await.unwrap();
    assert_eq!(s.request(id).unwrap().output_ids, vec![t1]);
}

#[tokio::test]
async fn jump_forward_is_truncated_without_spare_slots() {
    let engine = ReferenceEngine::new(VOCAB).with_jump_forward(vec![7, 8, 9]);
    let mut s = Scheduler::new(SchedulerConfig {
        disable_radix_cache: true,
        ..config(10)
    })
    .unwrap();

    let a = s
        .submit(SubmitRequest::new(vec![1, 2, 3]).with_sampling(SamplingParams {
            regex: Some("x".into()),
            ..greedy(16)
        }))
        .unwrap();
    let b = submit(&mut s, &[4, 5, 6], 16);
    step(&mut s, &engine).await.unwrap();

    // B's reserved slot is never handed to A's forced tokens.
    let t1 = engine.next_token(&[1, 2, 3]);
    assert_eq!(s.request(a).unwrap().output_ids, vec![t1, 7, 8]);
    assert_eq!(s.request(b).unwrap().output_ids.len(), 1);
    assert_eq!(s.pool().available(), 0);
    s.check_invariants().unwrap();
}

#[tokio::test]
async fn engine_failure_releases_the_batch() {
    let mut s = Scheduler::new(config(32)).unwrap();
    let a = submit(&mut s, &[1, 2, 3], 4);
    let b = submit(&mut s, &[4, 5], 4);

    let plan = s.schedule().unwrap().unwrap();
    s.fail_batch(&plan, &CanopyError::EngineFault("device lost".into()))
        .unwrap();

    let events = s.take_events();
    for id in [a, b] {
        assert!(matches!(
            finish_of(&events, id),
            Some(EventKind::Error { message }) if message.contains("device lost")
        ));
    }
    assert!(s.is_idle());
    assert_eq!(s.pool().available(), 32);
    assert_eq!(s.tree().total_slots(), 0);
    assert_eq!(s.stats().failed, 2);
}

#[tokio::test]
async fn missing_token_fails_only_that_request() {
    let engine = ReferenceEngine::new(VOCAB);
    let mut s = Scheduler::new(config(32)).unwrap();
    let a = submit(&mut s, &[1, 2, 3], 4);
    let b = submit(&mut s, &[4, 5], 4);

    let plan = s.schedule().unwrap().unwrap();
    let mut sampled = engine.run(&plan).await.unwrap();
    sampled.remove(&a);
    s.process_output(&plan, sampled).unwrap();

    let events = s.take_events();
    assert!(matches!(finish_of(&events, a), Some(EventKind::Error { .. })));
    assert_eq!(s.request(b).unwrap().output_ids.len(), 1);
    s.check_invariants().unwrap();
}

#[tokio::test]
async fn plans_must_complete_in_order() {
    let engine = ReferenceEngine::new(VOCAB);
    let mut s = Scheduler::new(config(32)).unwrap();
    submit(&mut s, &[1, 2, 3], 4);

    let plan = s.schedule().unwrap().unwrap();
    assert!(matches!(s.schedule(), Err(CanopyError::InvariantBreak(_))));

    let sampled = engine.run(&plan).await.unwrap();
    s.process_output(&plan, sampled.clone()).unwrap();
    assert!(matches!(
        s.process_output(&plan, sampled),
        Err(CanopyError::InvariantBreak(_))
    ));
}

#[tokio::test]
async fn flush_cache_only_when_idle() {
    let engine = ReferenceEngine::new(VOCAB);
    let mut s = Scheduler::new(config(32)).unwrap();
    submit(&mut s, &[1, 2, 3], 2);
    step(&mut s, &engine).await.unwrap();

    assert!(matches!(s.flush_cache(), Err(CanopyError::CacheInUse { .. })));

    run_to_idle(&mut s, &engine).await;
    assert!(s.tree().total_slots() > 0);
    s.flush_cache().unwrap();
    assert_eq!(s.tree().total_slots(), 0);
    assert_eq!(s.pool().available(), 32);
}

#[test]
fn stats_snapshot() {
    let mut s = Scheduler::new(config(16)).unwrap();
    submit(&mut s, &[1, 2, 3], 2);

    let stats = s.stats();
    assert_eq!(stats.waiting, 1);
    assert_eq!(stats.running, 0);
    assert_eq!(stats.free_slots, 16);

    s.schedule().unwrap();
    let stats = s.stats();
    assert_eq!(stats.ticks, 1);
    assert_eq!(stats.running, 1);
    assert_eq!(stats.free_slots, 13);
    assert_eq!(stats.prefill_tokens, 3);
}

mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Submit(Vec<u32>, usize),
        Abort(usize),
        Tick,
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (prop::collection::vec(0u32..4, 1..10), 1usize..8)
                .prop_map(|(p, n)| Op::Submit(p, n)),
            1 => (0usize..32).prop_map(Op::Abort),
            4 => Just(Op::Tick),
        ]
    }

    prop_compose! {
        fn arb_config()(
            k in 16usize..48,
            r in 1usize..6,
            p in 2usize..24,
            policy in prop::sample::select(SchedulePolicy::ALL.to_vec()),
            disabled in any::<bool>(),
        ) -> SchedulerConfig {
            SchedulerConfig {
                max_total_tokens: k,
                max_running_requests: r,
                max_prefill_tokens: p,
                schedule_heuristic: policy,
                disable_radix_cache: disabled,
                random_seed: Some(3),
                ..Default::default()
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Invariant: slots are conserved and singly owned at every tick,
        /// and every workload drains.
        #[test]
        fn invariant_conservation_under_random_workload(
            cfg in arb_config(),
            ops in prop::collection::vec(arb_op(), 1..60),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let engine = ReferenceEngine::new(VOCAB);
                let capacity = cfg.max_total_tokens;
                let mut s = Scheduler::new(cfg).unwrap();
                let mut ids = Vec::new();

                for op in ops {
                    match op {
                        Op::Submit(prompt, max_new) => {
                            ids.push(submit(&mut s, &prompt, max_new));
                        }
                        Op::Abort(i) => {
                            if let Some(id) = ids.get(i) {
                                let _ = s.abort(*id);
                            }
                        }
                        Op::Tick => {
                            step(&mut s, &engine).await;
                        }
                    }
                    s.check_invariants().unwrap();
                }

                run_to_idle(&mut s, &engine).await;
                s.check_invariants().unwrap();
                assert_eq!(s.pool().available() + s.tree().total_slots(), capacity);
                assert_eq!(s.tree().protected_slots(), 0);
            });
        }
    }
}
