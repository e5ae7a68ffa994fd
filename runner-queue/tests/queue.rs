//! Queue and dispatcher behaviour across processes and runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mlrunner_queue::dispatcher::{CommandBuilder, Dispatcher, DispatcherConfig};
use mlrunner_queue::store::{ClaimedTask, Credentials, RunCommand, TaskQueue, TaskStatus};
use tokio::process::Command;

fn command(name: &str) -> RunCommand {
    RunCommand {
        input_data_folder: PathBuf::from("/data").join(name),
        output_folder: PathBuf::from("/out").join(name),
        config_path: PathBuf::from("/config.toml"),
        max_iterations: 2,
        need_user_input: false,
        initial_user_input: None,
        extract_to: None,
    }
}

/// Runs `sh -c <script>`, exposing the task's output folder as `$OUT`.
struct Shell(&'static str);

impl CommandBuilder for Shell {
    fn build(&self, task: &ClaimedTask) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(self.0)
            .env("OUT", &task.command.output_folder)
            .envs(&task.credentials);
        cmd
    }
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[test]
fn a_second_connection_sees_the_same_queue() {
    let temp = tempfile::tempdir().expect("tempdir");
    let db = temp.path().join("queue.db");
    let submitter = TaskQueue::open(&db).expect("open submitter");
    let worker = TaskQueue::open(&db).expect("open worker");

    submitter.submit("t1", &command("t1"), &Credentials::new()).expect("t1");
    submitter.submit("t2", &command("t2"), &Credentials::new()).expect("t2");

    let claimed = worker.next().expect("next").expect("t1 claimed");
    assert_eq!(claimed.task_id, "t1");
    assert!(submitter.next().expect("next").is_none(), "t1 is still running");
    assert_eq!(
        submitter.status("t1").expect("status").expect("t1").status,
        TaskStatus::Running
    );

    worker.complete("t1").expect("complete");
    assert_eq!(submitter.next().expect("next").expect("t2").task_id, "t2");

    let raw = rusqlite::Connection::open(&db).expect("open raw");
    let mut stmt = raw.prepare("SELECT name FROM pragma_index_list('tasks')").expect("prepare");
    let indexes: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .expect("index list")
        .collect::<Result<_, _>>()
        .expect("index names");
    for expected in ["tasks_status", "tasks_created_at", "tasks_run_id", "tasks_one_running"] {
        assert!(indexes.iter().any(|name| name == expected), "{expected} missing from {indexes:?}");
    }
    let key: String = raw
        .query_row("SELECT name FROM pragma_table_info('tasks') WHERE pk = 1", [], |row| row.get(0))
        .expect("primary key");
    assert_eq!(key, "id");
}

#[test]
fn stale_running_tasks_are_reclaimed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let queue = TaskQueue::open(&temp.path().join("queue.db")).expect("open");
    queue.submit("crashed", &command("crashed"), &Credentials::new()).expect("submit");
    queue.submit("waiting", &command("waiting"), &Credentials::new()).expect("submit");
    queue.next().expect("next").expect("claimed");

    assert_eq!(queue.cleanup_stale(Duration::from_secs(3600)).expect("cleanup"), 0);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(queue.cleanup_stale(Duration::from_millis(1)).expect("cleanup"), 1);

    assert!(queue.status("crashed").expect("status").is_none());
    assert_eq!(queue.next().expect("next").expect("waiting").task_id, "waiting");
}

#[cfg(unix)]
#[tokio::test]
async fn dispatcher_drains_tasks_in_submission_order() {
    let temp = tempfile::tempdir().expect("tempdir");
    let db = temp.path().join("queue.db");
    let queue = Arc::new(TaskQueue::open(&db).expect("open"));
    let order = temp.path().join("order.txt");

    let creds = Credentials::new();
    for (i, id) in ["t1", "t2", "t3"].into_iter().enumerate() {
        let mut cmd = command(id);
        cmd.output_folder = order.clone();
        assert_eq!(queue.submit(id, &cmd, &creds).expect("submit"), i as u64);
    }

    let config = DispatcherConfig {
        poll_interval: Duration::from_millis(20),
        ..DispatcherConfig::default()
    };
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&queue),
        Arc::new(Shell("echo $$ >> \"$OUT\"; echo done")),
        config,
    ));

    // Drive the first task by hand, then check the queue moved up.
    let first = queue.next().expect("next").expect("t1");
    let finished = dispatcher.dispatch(first).await.expect("dispatch t1");
    assert_eq!(finished.exit_code, Some(0));
    assert_eq!(queue.status("t2").expect("status").expect("t2").position, 0);
    assert_eq!(queue.status("t3").expect("status").expect("t3").position, 1);

    let handle = dispatcher.start().expect("start");
    wait_until("all runs", || dispatcher.finished().len() == 3).await;
    dispatcher.shutdown();
    handle.await.expect("dispatcher loop");

    let ids: Vec<_> = dispatcher.finished().into_iter().map(|run| run.task_id).collect();
    assert_eq!(ids, vec!["t1", "t2", "t3"]);
    assert_eq!(
        std::fs::read_to_string(&order).expect("order").lines().count(),
        3
    );
    for id in ["t1", "t2", "t3"] {
        assert!(queue.status(id).expect("status").is_none());
        assert_eq!(dispatcher.logs(id).expect("logs").all(), vec!["done"]);
    }
}

#[cfg(unix)]
#[tokio::test]
async fn terminating_a_run_reaches_its_whole_process_group() {
    let temp = tempfile::tempdir().expect("tempdir");
    let queue = Arc::new(TaskQueue::open(&temp.path().join("queue.db")).expect("open"));
    let pid_file = temp.path().join("grandchild.pid");
    let mut cmd = command("long");
    cmd.output_folder = pid_file.clone();
    queue.submit("long", &cmd, &Credentials::new()).expect("submit");

    let config = DispatcherConfig {
        poll_interval: Duration::from_millis(20),
        kill_grace: Duration::from_millis(500),
        ..DispatcherConfig::default()
    };
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&queue),
        Arc::new(Shell("sleep 30 & echo $! > \"$OUT\"; wait")),
        config,
    ));
    let handle = dispatcher.start().expect("start");

    wait_until("grandchild pid", || pid_file.exists() && read_pid(&pid_file).is_some()).await;
    assert!(dispatcher.terminate_current());
    // The backgrounded sleep holds the output pipe open, so the run only
    // finishes once the signal reached it too.
    wait_until("run finished", || !dispatcher.finished().is_empty()).await;

    let finished = dispatcher.finished();
    let run = &finished[0];
    assert!(run.terminated);
    assert!(queue.status("long").expect("status").is_none());

    dispatcher.shutdown();
    handle.await.expect("dispatcher loop");
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}
