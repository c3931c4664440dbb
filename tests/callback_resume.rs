//! Deferred steps and the callback re-entry contract: resumption with
//! success and error statuses, unknown activations, cancellation, and the
//! synchronous-request guard.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use skein_core::catalog::MemoryCatalog;
use skein_core::config::EngineConfig;
use skein_core::definition::*;
use skein_core::error::{Result, SkeinError};
use skein_core::event::EventBus;
use skein_core::traits::{ActionProvider, ActivationStore, SecretStore};
use skein_core::types::*;
use skein_engine::{Engine, InvokeReply, InvokeRequest};
use skein_store::MemoryStore;

struct NoSecrets;

impl SecretStore for NoSecrets {
    fn secrets(&self, _project_id: &str, _keys: &[String]) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async { Ok(vec![]) })
    }
}

struct AcceptingRunner;

impl ActionProvider for AcceptingRunner {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Job
    }

    fn invoke(&self, _invocation: ActionInvocation) -> BoxFuture<'_, Result<ActionOutcome>> {
        Box::pin(async { Ok(ActionOutcome::deferred()) })
    }
}

fn job_skill(name: &str) -> SkillDefinition {
    SkillDefinition {
        project_id: "p".into(),
        name: name.into(),
        title: None,
        properties: vec![],
        routing: RoutingRules {
            all: Some(Route {
                action: None,
                runtime: RuntimeKind::Job,
                output_name: Some("done".into()),
            }),
            ..Default::default()
        },
    }
}

fn linear_job_agent() -> AgentDefinition {
    AgentDefinition {
        project_id: "p".into(),
        name: "deferred-flow".into(),
        title: None,
        inputs: vec![Signal {
            signal_id: "in".into(),
            name: "submit".into(),
            output: Some("done".into()),
            mode: None,
            properties: HashMap::new(),
        }],
        outputs: vec![Signal {
            signal_id: "out".into(),
            name: "done".into(),
            output: None,
            mode: None,
            properties: HashMap::new(),
        }],
        skills: vec![SkillRef {
            ref_id: "s1".into(),
            skill: "work".into(),
            title: None,
            properties: HashMap::new(),
        }],
        mappings: vec![
            Mapping {
                from: "in".into(),
                to: "s1".into(),
                from_output: None,
                to_input: None,
            },
            Mapping {
                from: "s1".into(),
                to: "out".into(),
                from_output: None,
                to_input: None,
            },
        ],
        catch: None,
        finally: None,
    }
}

struct Fixture {
    engine: Arc<Engine>,
    store: Arc<MemoryStore>,
}

fn fixture() -> Fixture {
    let catalog = MemoryCatalog::new();
    catalog.add_skill(job_skill("work"));
    catalog.add_agent(linear_job_agent());

    let store = Arc::new(MemoryStore::new());
    let engine = Engine::new(
        EngineConfig {
            retain_finished: true,
            ..Default::default()
        },
        Arc::new(catalog),
        store.clone(),
        Arc::new(NoSecrets),
        Arc::new(EventBus::default()),
    );
    engine.register_provider(Arc::new(AcceptingRunner));
    Fixture { engine, store }
}

async fn invoke_and_wait_for_dispatch(fixture: &Fixture) -> RequestId {
    let reply = fixture
        .engine
        .invoke_agent(InvokeRequest {
            project_id: "p".into(),
            name: "deferred-flow".into(),
            payload: serde_json::json!({"job": true}),
            ..Default::default()
        })
        .await
        .unwrap();
    let request_id = match reply {
        InvokeReply::Accepted { request_id } => request_id,
        other => panic!("expected async acceptance, got {other:?}"),
    };

    for _ in 0..400 {
        let transits = fixture.store.transits(&request_id).await.unwrap();
        if transits
            .iter()
            .any(|t| t.to == "s1" && t.status == TransitStatus::Started)
        {
            return request_id;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("deferred step never dispatched");
}

fn callback(request_id: &RequestId, status: Option<&str>, payload: serde_json::Value) -> Continuation {
    Continuation {
        request_id: request_id.clone(),
        project_id: "p".into(),
        session_id: None,
        channel_id: "s1".into(),
        output_name: Some("done".into()),
        message_id: None,
        status: status.map(str::to_string),
        payload,
        properties: HashMap::new(),
        headers: HashMap::new(),
        token: None,
    }
}

async fn wait_for_terminal(fixture: &Fixture, request_id: &RequestId) -> Activation {
    for _ in 0..400 {
        let activation = fixture.store.get(request_id).await.unwrap().unwrap();
        if activation.status.is_terminal() {
            return activation;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("activation never finalized");
}

#[tokio::test]
async fn successful_callback_resumes_to_completion() {
    let fixture = fixture();
    let request_id = invoke_and_wait_for_dispatch(&fixture).await;

    fixture
        .engine
        .resume(callback(&request_id, None, serde_json::json!({"result": 7})))
        .await
        .unwrap();

    let activation = wait_for_terminal(&fixture, &request_id).await;
    assert_eq!(activation.status, ActivationStatus::Complete);
    assert_eq!(activation.response.unwrap()["result"], 7);
}

#[tokio::test]
async fn error_callback_finalizes_as_error() {
    let fixture = fixture();
    let request_id = invoke_and_wait_for_dispatch(&fixture).await;

    fixture
        .engine
        .resume(callback(
            &request_id,
            Some("error"),
            serde_json::json!({"error": "runner exploded"}),
        ))
        .await
        .unwrap();

    let activation = wait_for_terminal(&fixture, &request_id).await;
    assert_eq!(activation.status, ActivationStatus::Error);
    assert_eq!(activation.response.unwrap()["error"], "runner exploded");
}

#[tokio::test]
async fn resume_unknown_activation_is_rejected() {
    let fixture = fixture();
    let err = fixture
        .engine
        .resume(callback(
            &RequestId::from_string("ghost"),
            None,
            serde_json::Value::Null,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, SkeinError::ActivationNotFound(_)));
}

#[tokio::test]
async fn cancel_marks_terminal_and_blocks_resumption() {
    let fixture = fixture();
    let request_id = invoke_and_wait_for_dispatch(&fixture).await;

    fixture.engine.cancel(&request_id).await.unwrap();
    let activation = fixture.store.get(&request_id).await.unwrap().unwrap();
    assert_eq!(activation.status, ActivationStatus::Cancelled);

    // A callback for the cancelled activation changes nothing.
    fixture
        .engine
        .resume(callback(&request_id, None, serde_json::json!({"late": true})))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let activation = fixture.store.get(&request_id).await.unwrap().unwrap();
    assert_eq!(activation.status, ActivationStatus::Cancelled);
}

#[tokio::test]
async fn synchronous_request_rejected_for_deferred_plan() {
    let fixture = fixture();
    let reply = fixture
        .engine
        .invoke_agent(InvokeRequest {
            project_id: "p".into(),
            name: "deferred-flow".into(),
            payload: serde_json::json!({}),
            synchronous: true,
            ..Default::default()
        })
        .await
        .unwrap();

    match reply {
        InvokeReply::Completed {
            request_id,
            status,
            response,
        } => {
            assert_eq!(status, ActivationStatus::Error);
            let text = response["error"].as_str().unwrap();
            assert!(text.contains("asynchronous"), "unexpected error: {text}");
            // The failure stays queryable under the activation id.
            let activation = fixture.store.get(&request_id).await.unwrap().unwrap();
            assert_eq!(activation.status, ActivationStatus::Error);
        }
        other => panic!("expected completed reply, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_compile_still_creates_a_queryable_activation() {
    let fixture = fixture();
    let reply = fixture
        .engine
        .invoke_agent(InvokeRequest {
            project_id: "p".into(),
            name: "no-such-agent".into(),
            payload: serde_json::json!({}),
            synchronous: true,
            ..Default::default()
        })
        .await
        .unwrap();

    match reply {
        InvokeReply::Completed {
            request_id, status, ..
        } => {
            assert_eq!(status, ActivationStatus::Error);
            let activation = fixture.store.get(&request_id).await.unwrap().unwrap();
            assert_eq!(activation.status, ActivationStatus::Error);
            assert!(activation.response.unwrap()["error"]
                .as_str()
                .unwrap()
                .contains("no-such-agent"));
        }
        other => panic!("expected completed reply, got {other:?}"),
    }
}
