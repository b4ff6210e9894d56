use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::tempdir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use testrelay::archive::{ArchiveReporter, ArchiveSettings, DESCRIPTOR_FILE, Descriptor};
use testrelay::browser::CommandLauncher;
use testrelay::runner::{RunOptions, Runner, RunnerParts, RunnerSettings};
use testrelay::shutdown::shutdown_channel;
use testrelay::tasks::TaskManager;
use testrelay::transport::LongPollServer;

const FIREFOX: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:47.0) Gecko/20100101 Firefox/47.0";

async fn post(client: &reqwest::Client, url: &str, body: &Value) -> Result<Value, String> {
    client
        .post(url)
        .header("User-Agent", FIREFOX)
        .body(body.to_string())
        .send()
        .await
        .map_err(|err| format!("request to {url} failed: {err}"))?
        .json::<Value>()
        .await
        .map_err(|err| format!("invalid response from {url}: {err}"))
}

fn first_of(reply: &Value, kind: &str) -> Result<Value, String> {
    reply
        .as_array()
        .and_then(|messages| {
            messages
                .iter()
                .find(|message| message.get("type").and_then(Value::as_str) == Some(kind))
        })
        .cloned()
        .ok_or_else(|| format!("expected a {kind} message in {reply}"))
}

fn read_descriptor(dir: &Path) -> Result<Descriptor, String> {
    let text = std::fs::read_to_string(dir.join(DESCRIPTOR_FILE))
        .map_err(|err| format!("read {} failed: {}", dir.display(), err))?;
    serde_json::from_str(&text).map_err(|err| format!("parse descriptor failed: {}", err))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn e2e_agent_registers_runs_and_lands_in_the_archive() -> Result<(), String> {
    let workdir = tempdir().map_err(|err| format!("tempdir failed: {}", err))?;
    let archive = Arc::new(
        ArchiveReporter::new(&ArchiveSettings {
            id: Some("e2e".to_owned()),
            workdir: workdir.path().to_path_buf(),
            scenario: "smoke".to_owned(),
            enable_screenshots: false,
            ..ArchiveSettings::default()
        })
        .map_err(|err| format!("archive setup failed: {}", err))?,
    );
    let tasks = Arc::new(TaskManager::new());
    let runner = Runner::start(
        RunnerSettings {
            poll_timeout: Duration::from_secs(5),
            lost_grace: Duration::from_millis(100),
            ..RunnerSettings::default()
        },
        RunnerParts {
            browsers: Vec::new(),
            farms: Vec::new(),
            launcher: Arc::new(CommandLauncher::new(Arc::clone(&tasks))),
            parking: None,
            archive: Some(Arc::clone(&archive)),
            tasks,
        },
    );
    let server = LongPollServer::bind("127.0.0.1", 0, Arc::clone(&runner))
        .await
        .map_err(|err| format!("bind failed: {}", err))?;
    let addr = server
        .local_addr()
        .map_err(|err| format!("addr failed: {}", err))?;
    let (shutdown_tx, _) = shutdown_channel();
    let server_task = tokio::spawn(server.serve(shutdown_tx.subscribe()));
    let base = format!("http://{addr}/~testrelay");
    let client = reqwest::Client::new();

    let stale = post(&client, &format!("{base}/register?sessionId=s1&runnerId=0"), &json!([])).await?;
    first_of(&stale, "reload")?;

    let register_url = format!(
        "{base}/register?sessionId=s1&runnerId={}",
        runner.runner_id()
    );
    let handshake = first_of(&post(&client, &register_url, &json!([])).await?, "handshake")?;
    let agent_id = handshake
        .get("agentId")
        .and_then(Value::as_u64)
        .ok_or("handshake without agentId")?;
    let proxy_id = handshake
        .get("proxyId")
        .and_then(Value::as_str)
        .ok_or("handshake without proxyId")?
        .to_owned();

    let group = runner.group_of(agent_id).ok_or("registered agent has no group")?;
    let run_id = runner
        .start_test_run(RunOptions {
            files: vec!["specs/login.js".to_owned()],
            groups: vec![group],
            ..RunOptions::default()
        })
        .map_err(|err| format!("start failed: {}", err))?;

    let poll_url =
        format!("{base}/messages?agentId={agent_id}&proxyId={proxy_id}&runId={run_id}");
    let start = first_of(&post(&client, &poll_url, &json!([])).await?, "startTestRun")?;
    if start.get("runId").and_then(Value::as_u64) != Some(run_id) {
        return Err(format!("unexpected startTestRun {start}"));
    }

    let results = json!([
        {"seq": 1, "type": "testRunStarted"},
        {"seq": 2, "type": "testSuiteEnter", "id": "s1", "name": "Login", "fileName": "specs/login.js"},
        {"seq": 3, "type": "testAdded", "id": "t1", "name": "accepts valid users"},
        {"seq": 4, "type": "testStarted", "id": "t1"},
        {"seq": 5, "type": "testFinished", "id": "t1", "passed": false},
        {"seq": 6, "type": "testSuiteLeave"},
        {"seq": 7, "type": "testRunFinished"}
    ]);
    let updates_url =
        format!("{base}/updates?agentId={agent_id}&proxyId={proxy_id}&runId={run_id}");
    let ack = post(&client, &updates_url, &results).await?;
    if ack != json!([]) {
        return Err(format!("updates should answer with an empty array, got {ack}"));
    }
    runner
        .settle()
        .await
        .map_err(|err| format!("settle failed: {}", err))?;

    let unknown = post(&client, &format!("{base}/messages?agentId=999"), &json!([])).await?;
    let redirect = first_of(&unknown, "redirect")?;
    if redirect.get("url").and_then(Value::as_str) != Some("about:blank") {
        return Err(format!("unexpected redirect {redirect}"));
    }

    let mut socket = TcpStream::connect(addr)
        .await
        .map_err(|err| format!("connect failed: {}", err))?;
    let request = format!(
        "POST /~testrelay/messages?agentId={agent_id}&proxyId={proxy_id} HTTP/1.1\r\nHost: {addr}\r\nContent-Length: 2\r\n\r\n[]"
    );
    socket
        .write_all(request.as_bytes())
        .await
        .map_err(|err| format!("write failed: {}", err))?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(socket);
    tokio::time::sleep(Duration::from_millis(500)).await;
    let lost = runner.link(agent_id).is_some_and(|link| link.is_lost());
    if !lost {
        return Err("dropped poll should mark the agent lost after the grace period".to_owned());
    }

    let zip = archive
        .flush()
        .await
        .map_err(|err| format!("flush failed: {}", err))?;
    if !zip.exists() {
        return Err(format!("missing archive zip {}", zip.display()));
    }
    let root = read_descriptor(&workdir.path().join("e2e"))?;
    if root.failures.get("firefox47") != Some(&1) {
        return Err(format!("unexpected root failures {:?}", root.failures));
    }
    let suite = read_descriptor(&workdir.path().join("e2e/smoke/specs/login.js/Login"))?;
    if suite.children.len() != 1 {
        return Err(format!("unexpected suite children {:?}", suite.children));
    }

    drop(shutdown_tx.send(()));
    runner.destroy().await;
    server_task
        .await
        .map_err(|err| format!("server task failed: {}", err))?;
    Ok(())
}
