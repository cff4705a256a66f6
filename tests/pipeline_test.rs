use std::cell::RefCell;
use std::sync::Arc;

use genai_pipeline::engine::MockBackend;
use genai_pipeline::{
    CancellationToken, ChatConfig, ErrorKind, GenerateArgs, PipelineConfig, PipelineController,
    PipelineError, Role,
};
use serde_json::json;

fn pipeline_with(backend: &MockBackend, config: PipelineConfig) -> PipelineController {
    PipelineController::with_backend(
        "LLMPipeline",
        "./tests/models/mock",
        "AUTO",
        Arc::new(backend.clone()),
        config,
    )
    .expect("construct pipeline")
}

fn ready(backend: &MockBackend) -> PipelineController {
    let pipeline = pipeline_with(backend, PipelineConfig::default());
    pipeline.init().expect("init pipeline");
    pipeline
}

fn noop(_: &str) -> anyhow::Result<()> {
    Ok(())
}

#[test]
fn generates_hello_world_with_string_options() {
    let backend = MockBackend::new().reply_when("Hello world!", "Hello world!");
    let pipeline = ready(&backend);
    pipeline.start_chat().expect("start chat");

    let result = pipeline
        .generate(
            GenerateArgs::new()
                .prompt("Type \"Hello world!\" in English")
                .callback(noop)
                .options(json!({ "temperature": "0", "max_new_tokens": "4" })),
        )
        .expect("generate");
    assert_eq!(result, "Hello world!");

    let params = &backend.stats().params[0];
    assert_eq!(params.temperature, 0.0);
    assert_eq!(params.max_new_tokens, 4);

    pipeline.finish_chat().expect("finish chat");
}

#[test]
fn init_twice_fails() {
    let pipeline = ready(&MockBackend::new());

    let err = pipeline.init().unwrap_err();
    assert_eq!(err.to_string(), "Pipeline is already initialized");
    assert_eq!(err.kind(), ErrorKind::Initialization);
}

#[test]
fn failed_init_keeps_active_chat() {
    let backend = MockBackend::new();
    let pipeline = ready(&backend);
    pipeline.start_chat().expect("start chat");

    let err = pipeline.init().unwrap_err();
    assert_eq!(err.to_string(), "Pipeline is already initialized");
    assert!(pipeline.is_chat_active());
    assert_eq!(backend.stats().loads.len(), 1);

    pipeline.finish_chat().expect("finish chat");
    assert!(!pipeline.is_chat_active());
}

#[test]
fn start_chat_twice_fails() {
    let pipeline = ready(&MockBackend::new());
    pipeline.start_chat().expect("start chat");

    let err = pipeline.start_chat().unwrap_err();
    assert_eq!(err.to_string(), "Chat is already started");
    assert!(pipeline.is_chat_active());
}

#[test]
fn finish_without_chat_fails() {
    let pipeline = ready(&MockBackend::new());

    let err = pipeline.finish_chat().unwrap_err();
    assert_eq!(err.to_string(), "Chat is not started");
    assert_eq!(err.kind(), ErrorKind::State);
}

#[test]
fn chat_can_be_restarted_after_finish() {
    let backend = MockBackend::new();
    let pipeline = ready(&backend);

    pipeline.start_chat().expect("first chat");
    pipeline.finish_chat().expect("finish first chat");
    pipeline.start_chat().expect("second chat");

    let stats = backend.stats();
    assert_eq!(stats.sessions_begun, 2);
    assert_eq!(stats.sessions_ended, 1);
}

#[test]
fn generate_validates_arguments_in_order() {
    let pipeline = ready(&MockBackend::new());
    pipeline.start_chat().expect("start chat");

    let err = pipeline.generate(GenerateArgs::new()).unwrap_err();
    assert_eq!(err.to_string(), "Prompt must be a string");

    let err = pipeline
        .generate(GenerateArgs::new().prompt("prompt"))
        .unwrap_err();
    assert_eq!(err.to_string(), "Generation callback must be a function");

    let err = pipeline
        .generate(
            GenerateArgs::new()
                .prompt("prompt")
                .callback(noop)
                .options("options"),
        )
        .unwrap_err();
    assert_eq!(err.to_string(), "Options must be an object");
    assert_eq!(err.kind(), ErrorKind::Validation);

    // A bad prompt wins over a bad options value.
    let err = pipeline
        .generate(GenerateArgs::new().prompt(7).options("options"))
        .unwrap_err();
    assert_eq!(err.to_string(), "Prompt must be a string");
}

#[test]
fn invalid_option_values_are_rejected() {
    let pipeline = ready(&MockBackend::new());

    let err = pipeline
        .generate(
            GenerateArgs::new()
                .prompt("prompt")
                .callback(noop)
                .options(json!({ "temperature": "hot" })),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("temperature"));
}

#[test]
fn single_token_generation_returns_string_chunks() {
    let pipeline = ready(&MockBackend::new());
    pipeline.start_chat().expect("start chat");

    let chunks = RefCell::new(Vec::new());
    let reply = pipeline
        .generate(
            GenerateArgs::new()
                .prompt("prompt")
                .callback(|chunk: &str| {
                    chunks.borrow_mut().push(chunk.to_string());
                    Ok(())
                })
                .options(json!({ "max_new_tokens": 1 })),
        )
        .expect("generate");

    let chunks = chunks.into_inner();
    assert_eq!(chunks.len(), 1);
    assert_eq!(reply, chunks.concat());
}

#[test]
fn chunks_concatenate_to_the_result() {
    let backend = MockBackend::new().reply_when("story", "Once upon a time there was a crate.");
    let pipeline = ready(&backend);

    let mut seen = String::new();
    let reply = pipeline
        .generate_text("tell a story", Default::default(), |chunk| {
            assert!(!chunk.is_empty());
            seen.push_str(chunk);
            Ok(())
        })
        .expect("generate");

    assert_eq!(reply, "Once upon a time there was a crate.");
    assert_eq!(seen, reply);
}

#[test]
fn null_options_mean_defaults() {
    let backend = MockBackend::new();
    let pipeline = ready(&backend);

    pipeline
        .generate(
            GenerateArgs::new()
                .prompt("prompt")
                .callback(noop)
                .options(serde_json::Value::Null),
        )
        .expect("generate with null options");

    assert_eq!(backend.stats().params[0].max_new_tokens, 500);
}

#[test]
fn generation_before_init_fails_after_validation() {
    let pipeline = pipeline_with(&MockBackend::new(), PipelineConfig::default());

    let err = pipeline
        .generate(GenerateArgs::new().prompt("prompt").callback(noop))
        .unwrap_err();
    assert_eq!(err.to_string(), "Pipeline is not initialized");
}

#[test]
fn unknown_pipeline_kind_is_rejected() {
    let err = PipelineController::with_backend(
        "Whisper",
        "model",
        "CPU",
        Arc::new(MockBackend::new()),
        PipelineConfig::default(),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Initialization);
}

#[test]
fn unsupported_device_fails_init() {
    let backend = MockBackend::new();
    let pipeline = PipelineController::with_backend(
        "LLMPipeline",
        "model",
        "TPU",
        Arc::new(backend.clone()),
        PipelineConfig::default(),
    )
    .expect("construct");

    let err = pipeline.init().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Engine);
    assert!(!pipeline.is_initialized());
    assert!(backend.stats().loads.is_empty());
}

#[test]
fn controllers_are_independent() {
    let backend = MockBackend::new();
    let first = ready(&backend);
    let second = ready(&backend);

    first.start_chat().expect("start first chat");
    assert!(first.is_chat_active());
    assert!(!second.is_chat_active());

    second.start_chat().expect("start second chat");
    first.finish_chat().expect("finish first chat");
    assert!(second.is_chat_active());
    assert_eq!(backend.stats().loads.len(), 2);
}

#[test]
fn chat_history_conditions_later_turns() {
    let config = PipelineConfig {
        chat: ChatConfig {
            system_prompt: Some("You are terse.".to_string()),
            max_history_messages: 0,
        },
        ..PipelineConfig::default()
    };
    let backend = MockBackend::new()
        .reply_when("name", "Ferris.")
        .reply_when("again", "Still Ferris.");
    let pipeline = pipeline_with(&backend, config);
    pipeline.init().expect("init");
    pipeline.start_chat().expect("start chat");

    pipeline.generate_text("What is your name?", Default::default(), noop).expect("turn 1");
    pipeline.generate_text("Say it again", Default::default(), noop).expect("turn 2");

    let stats = backend.stats();
    let second_turn = &stats.generations[1];
    let roles: Vec<Role> = second_turn.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);
    assert_eq!(second_turn[2].content, "Ferris.");

    assert_eq!(pipeline.history().expect("history").len(), 5);
    pipeline.finish_chat().expect("finish chat");
    assert!(pipeline.history().expect("history").is_empty());
}

#[test]
fn generations_outside_chat_are_stateless() {
    let backend = MockBackend::new();
    let pipeline = ready(&backend);

    pipeline.generate_text("one", Default::default(), noop).expect("first");
    pipeline.generate_text("two", Default::default(), noop).expect("second");

    let stats = backend.stats();
    assert_eq!(stats.generations[1].len(), 1);
    assert_eq!(stats.generations[1][0].content, "two");
}

#[test]
fn callback_failure_aborts_and_rolls_back() {
    let backend = MockBackend::new().reply_when("count", "one two three four");
    let pipeline = ready(&backend);
    pipeline.start_chat().expect("start chat");

    let mut delivered = 0;
    let err = pipeline
        .generate_text("count please", Default::default(), |_| {
            delivered += 1;
            if delivered == 2 {
                anyhow::bail!("sink closed");
            }
            Ok(())
        })
        .unwrap_err();

    assert!(matches!(err, PipelineError::Callback(_)));
    assert_eq!(delivered, 2);
    assert!(pipeline.history().expect("history").is_empty());

    // The controller is usable again.
    let reply = pipeline
        .generate_text("count please", Default::default(), noop)
        .expect("retry");
    assert_eq!(reply, "one two three four");
}

#[test]
fn engine_failure_mid_stream_is_reported() {
    let backend = MockBackend::new()
        .reply_when("long", "a b c d")
        .fail_after(2);
    let pipeline = ready(&backend);
    pipeline.start_chat().expect("start chat");

    let mut chunks = Vec::new();
    let err = pipeline
        .generate_text("long answer", Default::default(), |c| {
            chunks.push(c.to_string());
            Ok(())
        })
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Engine);
    assert_eq!(chunks, vec!["a", " b"]);
    assert!(pipeline.history().expect("history").is_empty());
}

#[test]
fn cancellation_stops_delivery() {
    let backend = MockBackend::new().reply_when("count", "one two three four");
    let pipeline = ready(&backend);
    let token = CancellationToken::new();
    let trigger = token.clone();

    let delivered = RefCell::new(0);
    let err = pipeline
        .generate(
            GenerateArgs::new()
                .prompt("count")
                .callback(|_: &str| {
                    *delivered.borrow_mut() += 1;
                    trigger.cancel();
                    Ok(())
                })
                .cancel_token(token),
        )
        .unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled));
    assert_eq!(*delivered.borrow(), 1);
}

#[test]
fn cancelling_during_the_last_chunk_keeps_the_result() {
    let backend = MockBackend::new().reply_when("pair", "one two");
    let pipeline = ready(&backend);
    pipeline.start_chat().expect("start chat");
    let token = CancellationToken::new();
    let trigger = token.clone();

    let reply = pipeline
        .generate(
            GenerateArgs::new()
                .prompt("pair please")
                .callback(|chunk: &str| {
                    if chunk == " two" {
                        trigger.cancel();
                    }
                    Ok(())
                })
                .cancel_token(token),
        )
        .expect("fully delivered generation");

    assert_eq!(reply, "one two");
    assert_eq!(pipeline.history().expect("history").len(), 2);
}

#[test]
fn reentrant_calls_from_callback_are_rejected() {
    let pipeline = ready(&MockBackend::new());
    pipeline.start_chat().expect("start chat");

    let mut inner_results = Vec::new();
    pipeline
        .generate_text("hello", Default::default(), |_| {
            if inner_results.is_empty() {
                inner_results.push(pipeline.generate_text("nested", Default::default(), noop).map(|_| ()));
                inner_results.push(pipeline.finish_chat());
                inner_results.push(pipeline.start_chat());
                inner_results.push(pipeline.history().map(|_| ()));
                inner_results.push(pipeline.init());
            }
            Ok(())
        })
        .expect("outer generation");

    assert_eq!(inner_results.len(), 5);
    for result in inner_results {
        assert!(matches!(result, Err(PipelineError::GenerationInProgress)));
    }
    assert!(pipeline.is_chat_active());
    assert!(pipeline.is_initialized());
}

#[test]
fn sequential_calls_from_threads_are_serialized() {
    let backend = MockBackend::new();
    let pipeline = Arc::new(ready(&backend));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let pipeline = Arc::clone(&pipeline);
            std::thread::spawn(move || loop {
                match pipeline.generate_text(&format!("thread {}", i), Default::default(), noop) {
                    Ok(reply) => return reply,
                    Err(PipelineError::GenerationInProgress) => std::thread::yield_now(),
                    Err(e) => panic!("unexpected error: {}", e),
                }
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let reply = handle.join().expect("thread");
        assert_eq!(reply, format!("You said: thread {}", i));
    }
    assert_eq!(backend.stats().generations.len(), 4);
}

#[test]
fn dropping_releases_the_engine() {
    let backend = MockBackend::new();
    {
        let pipeline = ready(&backend);
        pipeline.start_chat().expect("start chat");
    }

    let stats = backend.stats();
    assert_eq!(stats.engines_released, 1);
    assert_eq!(stats.sessions_ended, 1);
}
