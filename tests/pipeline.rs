//! End-to-end tests for the chat pipeline against a real index, a
//! vocabulary embedder, and a scripted model.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{counting_session, session, write, ScriptedModel};
use futures::StreamExt;
use llama_assistant::config::RefreshPolicy;
use llama_assistant::models::{ChatContent, ChatRole, ChatTurn, ImageRef};
use llama_assistant::pipeline::{
    AgentResponse, ChatRequest, RagAgent, RefreshOutcome, Stage,
};
use tempfile::TempDir;

const QUERY: &str = "What is the capital of France?";

fn agent(model: &Arc<ScriptedModel>) -> RagAgent {
    RagAgent::new(model.clone())
}

#[tokio::test]
async fn paris_scenario_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let doc = write(tmp.path(), "doc1.txt", "Paris is the capital of France.");
    let model = Arc::new(ScriptedModel::new(QUERY, "Paris."));
    let agent = agent(&model);
    let mut session = session();

    let response = agent
        .chat_completion(&mut session, ChatRequest::new(QUERY).with_lookup_files([&doc]))
        .await
        .unwrap();
    let AgentResponse::Complete(turn) = response else {
        panic!("expected a complete response");
    };
    assert_eq!(turn, ChatTurn::assistant("Paris."));

    // Retrieval is enabled, so condensation ran even without history.
    assert_eq!(model.condense_calls(), 1);

    let final_request = model.last_answer_request();
    assert_eq!(final_request.len(), 1);
    let prompt = final_request[0].content.text();
    assert!(prompt.starts_with("Information that might help:"));
    assert!(prompt.contains("Paris is the capital of France."));
    assert!(prompt.contains("page_index: 0"));
    assert!(prompt.contains(&format!("file_path: {}", doc.display())));
    assert!(prompt.ends_with(&format!("{}\n", QUERY)));

    assert_eq!(
        session.history().turns(),
        &[ChatTurn::user(QUERY), ChatTurn::assistant("Paris.")]
    );
    assert_eq!(session.stage(), Stage::Idle);
}

#[tokio::test]
async fn no_files_and_no_history_sends_the_bare_query() {
    let model = Arc::new(ScriptedModel::new("unused", "Hello!"));
    let agent = agent(&model);
    let mut session = session();

    agent
        .chat_completion(&mut session, ChatRequest::new("hi there"))
        .await
        .unwrap();

    let requests = model.requests();
    assert_eq!(requests.len(), 1, "condensation must be skipped");
    assert_eq!(requests[0], vec![ChatTurn::user("hi there")]);
}

#[tokio::test]
async fn history_triggers_condensation_and_is_sent_to_the_model() {
    let model = Arc::new(ScriptedModel::new("standalone", "Fine."));
    let agent = agent(&model);
    let mut session = session();

    agent
        .chat_completion(&mut session, ChatRequest::new("first"))
        .await
        .unwrap();
    agent
        .chat_completion(&mut session, ChatRequest::new("second"))
        .await
        .unwrap();

    assert_eq!(model.condense_calls(), 1);
    let condense = &model.requests()[1];
    assert!(condense[0]
        .content
        .text()
        .contains("'''user: first\nassistant: Fine.\n'''"));

    let final_request = model.last_answer_request();
    assert_eq!(
        final_request,
        vec![
            ChatTurn::user("first"),
            ChatTurn::assistant("Fine."),
            ChatTurn::user("second"),
        ]
    );
}

#[tokio::test]
async fn history_holds_only_original_queries_and_answers() {
    let tmp = TempDir::new().unwrap();
    let doc = write(tmp.path(), "doc1.txt", "Paris is the capital of France.");
    let model = Arc::new(ScriptedModel::new("Context rewrite", "Paris."));
    let agent = agent(&model);
    let mut session = session();

    for q in [QUERY, "And of Germany?"] {
        agent
            .chat_completion(&mut session, ChatRequest::new(q).with_lookup_files([&doc]))
            .await
            .unwrap();
    }

    let history = session.history();
    assert_eq!(history.len(), 4);
    assert_eq!(history.turns()[0], ChatTurn::user(QUERY));
    assert_eq!(history.turns()[2], ChatTurn::user("And of Germany?"));
    for turn in history.turns() {
        let text = turn.content.text();
        assert!(!text.contains("Context:"), "condensed text leaked: {text}");
        assert!(!text.contains("Information that might help"), "context leaked: {text}");
    }
}

#[tokio::test]
async fn unchanged_lookup_set_does_not_touch_the_index() {
    let tmp = TempDir::new().unwrap();
    let a = write(tmp.path(), "a.txt", "Paris is the capital of France.");
    let model = Arc::new(ScriptedModel::new(QUERY, "Paris."));
    let agent = agent(&model);
    let (mut session, log) = counting_session();

    for _ in 0..3 {
        agent
            .chat_completion(&mut session, ChatRequest::new(QUERY).with_lookup_files([&a]))
            .await
            .unwrap();
    }

    assert_eq!(*log.lock(), vec!["clear", "rebuild a.txt"]);
}

#[tokio::test]
async fn growing_lookup_set_rebuilds_everything_by_default() {
    let tmp = TempDir::new().unwrap();
    let a = write(tmp.path(), "a.txt", "Paris is the capital of France.");
    let b = write(tmp.path(), "b.txt", "Berlin is the capital of Germany.");
    let model = Arc::new(ScriptedModel::new(QUERY, "Paris."));
    let agent = agent(&model);
    let (mut session, log) = counting_session();

    agent
        .chat_completion(&mut session, ChatRequest::new(QUERY).with_lookup_files([&a]))
        .await
        .unwrap();
    agent
        .chat_completion(
            &mut session,
            ChatRequest::new(QUERY).with_lookup_files([&a, &b]),
        )
        .await
        .unwrap();

    assert_eq!(
        *log.lock(),
        vec!["clear", "rebuild a.txt", "clear", "rebuild a.txt,b.txt"]
    );
    assert_eq!(session.index_stats().sources, 2);
}

#[tokio::test]
async fn incremental_policy_inserts_only_added_files() {
    let tmp = TempDir::new().unwrap();
    let a = write(tmp.path(), "a.txt", "Paris is the capital of France.");
    let b = write(tmp.path(), "b.txt", "Berlin is the capital of Germany.");
    let model = Arc::new(ScriptedModel::new(QUERY, "Paris."));
    let agent = agent(&model).with_refresh_policy(RefreshPolicy::Incremental);
    let (mut session, log) = counting_session();

    let first = agent
        .update_index(&mut session, [a.clone()].into_iter().collect())
        .await
        .unwrap();
    assert!(matches!(first, RefreshOutcome::Rebuilt(_)));

    let grown = agent
        .update_index(&mut session, [a.clone(), b.clone()].into_iter().collect())
        .await
        .unwrap();
    assert!(matches!(grown, RefreshOutcome::Extended(s) if s.sources == 2));

    // Removal falls back to a full rebuild.
    agent
        .update_index(&mut session, [b.clone()].into_iter().collect())
        .await
        .unwrap();

    assert_eq!(
        *log.lock(),
        vec!["clear", "rebuild a.txt", "insert b.txt", "clear", "rebuild b.txt"]
    );
}

#[tokio::test]
async fn emptied_lookup_set_clears_the_index() {
    let tmp = TempDir::new().unwrap();
    let a = write(tmp.path(), "a.txt", "Paris is the capital of France.");
    let model = Arc::new(ScriptedModel::new(QUERY, "Paris."));
    let agent = agent(&model);
    let (mut session, log) = counting_session();

    agent
        .chat_completion(&mut session, ChatRequest::new(QUERY).with_lookup_files([&a]))
        .await
        .unwrap();
    session.clear_chat_history();
    agent
        .chat_completion(&mut session, ChatRequest::new(QUERY))
        .await
        .unwrap();

    assert_eq!(*log.lock(), vec!["clear", "rebuild a.txt", "clear"]);
    // No index and no history: straight to the model.
    assert_eq!(model.last_answer_request(), vec![ChatTurn::user(QUERY)]);
    assert_eq!(model.condense_calls(), 1);
}

#[tokio::test]
async fn weak_matches_are_cut_off() {
    let tmp = TempDir::new().unwrap();
    let doc = write(tmp.path(), "zoo.txt", "zebra xylophone quartz");
    let model = Arc::new(ScriptedModel::new(QUERY, "No idea."));
    let agent = agent(&model);
    let mut session = session();

    agent
        .chat_completion(&mut session, ChatRequest::new(QUERY).with_lookup_files([&doc]))
        .await
        .unwrap();

    // Condensation ran because an index exists, but nothing passed the cutoff.
    assert_eq!(model.condense_calls(), 1);
    assert_eq!(model.last_answer_request(), vec![ChatTurn::user(QUERY)]);
}

#[tokio::test]
async fn model_failure_leaves_history_untouched() {
    let model = Arc::new(ScriptedModel::failing());
    let agent = agent(&model);
    let mut session = session();

    let err = agent
        .chat_completion(&mut session, ChatRequest::new("hello"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "model_inference");
    assert!(session.history().is_empty());
    assert_eq!(session.stage(), Stage::Failed);
}

#[tokio::test]
async fn index_failure_aborts_and_retries_next_time() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("missing.txt");
    let model = Arc::new(ScriptedModel::new(QUERY, "Paris."));
    let agent = agent(&model);
    let mut session = session();

    let err = agent
        .chat_completion(
            &mut session,
            ChatRequest::new(QUERY).with_lookup_files([&missing]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "index_build");
    assert!(session.lookup_files().is_empty());
    assert!(session.history().is_empty());
    assert!(model.requests().is_empty());

    write(tmp.path(), "missing.txt", "Paris is the capital of France.");
    agent
        .chat_completion(
            &mut session,
            ChatRequest::new(QUERY).with_lookup_files([&missing]),
        )
        .await
        .unwrap();
    assert_eq!(session.lookup_files().len(), 1);
    assert_eq!(session.history().len(), 2);
}

#[tokio::test]
async fn failed_refresh_then_previous_set_rebuilds() {
    let tmp = TempDir::new().unwrap();
    let a = write(tmp.path(), "a.txt", "Paris is the capital of France.");
    let missing = tmp.path().join("missing.txt");
    let model = Arc::new(ScriptedModel::new(QUERY, "Paris."));
    let agent = agent(&model);
    let (mut session, log) = counting_session();

    agent
        .chat_completion(&mut session, ChatRequest::new(QUERY).with_lookup_files([&a]))
        .await
        .unwrap();

    let err = agent
        .chat_completion(
            &mut session,
            ChatRequest::new(QUERY).with_lookup_files([&a, &missing]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "index_build");
    assert!(session.lookup_files().is_empty());
    assert_eq!(session.index_stats().chunks, 0);

    agent
        .chat_completion(&mut session, ChatRequest::new(QUERY).with_lookup_files([&a]))
        .await
        .unwrap();

    assert_eq!(
        *log.lock(),
        vec![
            "clear",
            "rebuild a.txt",
            "clear",
            "rebuild a.txt,missing.txt",
            "clear",
            "rebuild a.txt",
        ]
    );
    assert_eq!(session.lookup_files().len(), 1);
    assert_eq!(model.condense_calls(), 2);
    let final_request = model.last_answer_request();
    let prompt = final_request.last().unwrap().content.text();
    assert!(prompt.contains("Paris is the capital of France."), "{prompt}");
}

#[tokio::test]
async fn braces_in_indexed_text_reach_the_model_verbatim() {
    let tmp = TempDir::new().unwrap();
    let doc = write(
        tmp.path(),
        "agent.py",
        "Paris is the capital of France.\nprompt = \"{query_str} {node_context}\"",
    );
    let model = Arc::new(ScriptedModel::new(QUERY, "Paris."));
    let agent = agent(&model);
    let mut session = session();

    agent
        .chat_completion(&mut session, ChatRequest::new(QUERY).with_lookup_files([&doc]))
        .await
        .unwrap();

    let final_request = model.last_answer_request();
    let prompt = final_request[0].content.text();
    assert!(prompt.contains("prompt = \"{query_str} {node_context}\""), "{prompt}");
    assert!(prompt.ends_with(&format!("{}\n", QUERY)));
}

#[tokio::test]
async fn empty_query_is_rejected() {
    let model = Arc::new(ScriptedModel::new("x", "y"));
    let agent = agent(&model);
    let mut session = session();

    let err = agent
        .chat_completion(&mut session, ChatRequest::new("   "))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "bad_request");
    assert!(model.requests().is_empty());
}

#[tokio::test]
async fn image_is_attached_to_the_final_message_only() {
    let model = Arc::new(ScriptedModel::new("x", "A cat."));
    let agent = agent(&model);
    let mut session = session();

    let request = ChatRequest::new("what is this?").with_image(ImageRef::new("capture.png"));
    agent.chat_completion(&mut session, request).await.unwrap();

    let final_request = model.last_answer_request();
    assert_eq!(
        final_request[0].content,
        ChatContent::Multimodal {
            text: "what is this?".to_string(),
            image: ImageRef::new("capture.png"),
        }
    );
    assert_eq!(session.history().turns()[0], ChatTurn::user("what is this?"));
}

#[tokio::test]
async fn streamed_answer_commits_after_the_last_fragment() {
    let model = Arc::new(ScriptedModel::new("x", "Paris is lovely."));
    let agent = agent(&model);
    let mut session = session();

    let response = agent
        .chat_completion(&mut session, ChatRequest::new("tell me").streaming(true))
        .await
        .unwrap();
    let AgentResponse::Streaming(mut reply) = response else {
        panic!("expected a stream");
    };

    let mut fragments = Vec::new();
    while let Some(delta) = reply.next().await {
        // Nothing is committed while the stream is still open.
        assert!(session.history().is_empty());
        fragments.push(delta.unwrap().content.unwrap_or_default());
    }
    assert!(fragments.len() > 1);
    assert_eq!(fragments.concat(), "Paris is lovely.");

    let history = session.history();
    assert_eq!(history.turns()[0], ChatTurn::user("tell me"));
    assert_eq!(history.turns()[1].role, ChatRole::Assistant);
    assert_eq!(history.turns()[1].content.text(), "Paris is lovely.");
}

#[tokio::test]
async fn abandoned_stream_commits_nothing() {
    let model = Arc::new(ScriptedModel::new("x", "Paris is lovely."));
    let agent = agent(&model);
    let mut session = session();

    let response = agent
        .chat_completion(&mut session, ChatRequest::new("tell me").streaming(true))
        .await
        .unwrap();
    let AgentResponse::Streaming(mut reply) = response else {
        panic!("expected a stream");
    };
    reply.next().await;
    drop(reply);

    assert!(session.history().is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_model_times_out_without_committing() {
    let model = Arc::new(ScriptedModel::slow(Duration::from_secs(30)));
    let agent = agent(&model).with_timeout(Duration::from_millis(50));
    let mut session = session();

    let err = agent
        .chat_completion(&mut session, ChatRequest::new("hello"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "timeout");
    assert!(session.history().is_empty());
    assert_eq!(session.stage(), Stage::Failed);
}
