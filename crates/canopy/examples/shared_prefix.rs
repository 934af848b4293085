//! Shared prefix example.
//!
//! Sends several requests that share a long system prompt and shows how
//! much of each prompt the prefix cache served.

use anyhow::Result;
use canopy::prelude::*;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let engine = ReferenceEngine::new(32_000).with_eos(2);
    let (server, join) = Server::builder()
        .max_total_tokens(2048)
        .max_running_requests(4)
        .spawn(Arc::new(engine))?;

    let system_prompt: Vec<u32> = (100..400).collect();
    let questions: [&[u32]; 4] = [&[7, 8, 9], &[7, 8, 10], &[11, 12], &[13]];

    for question in questions {
        let mut input = system_prompt.clone();
        input.extend_from_slice(question);
        let request = SubmitRequest::new(input)
            .with_sampling(SamplingParams::greedy().with_max_new_tokens(16));

        let submission = server.submit(request).await?;
        let id = submission.id();
        for event in submission.collect().await {
            if let EventKind::Finish {
                reason,
                prompt_tokens,
                completion_tokens,
                cached_tokens,
            } = event.kind
            {
                println!(
                    "{id}: {reason:?} after {completion_tokens} tokens, \
                     {cached_tokens}/{prompt_tokens} prompt tokens cached"
                );
            }
        }
    }

    let stats = server.stats();
    println!("Scheduler stats: {}", serde_json::to_string_pretty(&stats)?);

    server.shutdown().await;
    join.await??;
    Ok(())
}
