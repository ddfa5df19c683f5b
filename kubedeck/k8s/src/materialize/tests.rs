use super::*;
use kubedeck_core::{store::MemoryStore, AuthMode, Endpoint, SecretKey};
use std::sync::atomic::{AtomicUsize, Ordering};

const AWS_CREDENTIALS: &str =
    "[default]\naws_access_key_id = AKIAEXAMPLEKEY\naws_secret_access_key = wJalrXUtnFEMIEXAMPLE\n";

#[derive(Default)]
struct FakeRunner {
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: Mutex<Vec<(ExecSpec, EnvOverlay)>>,
    output: Mutex<HelperOutput>,
    delay: Duration,
}

#[async_trait::async_trait]
impl HelperRunner for FakeRunner {
    async fn run(&self, exec: &ExecSpec, env: &EnvOverlay) -> io::Result<HelperOutput> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        self.calls.lock().push((exec.clone(), env.clone()));
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(self.output.lock().clone())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    store: Arc<MemoryStore>,
    runner: Arc<FakeRunner>,
    materializer: Materializer,
}

fn fixture(runner: FakeRunner, timeout: Duration) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("credentials");
    let store = Arc::new(MemoryStore::default());
    let runner = Arc::new(runner);
    let materializer = Materializer::new(
        &root,
        SecretStore::new(SecretKey::from_passphrase("test")),
        store.clone(),
        runner.clone(),
        timeout,
    );
    Fixture {
        _dir: dir,
        root,
        store,
        runner,
        materializer,
    }
}

fn ok_runner() -> FakeRunner {
    FakeRunner {
        output: Mutex::new(HelperOutput {
            success: true,
            stdout: br#"{"kind":"ExecCredential"}"#.to_vec(),
            stderr: vec![],
        }),
        ..FakeRunner::default()
    }
}

fn exec(command: &str) -> ExecSpec {
    ExecSpec {
        api_version: "client.authentication.k8s.io/v1beta1".into(),
        command: command.into(),
        args: vec!["eks".into(), "get-token".into(), "--cluster-name".into(), "prod".into()],
        env: Default::default(),
    }
}

fn prod() -> ClusterDescriptor {
    ClusterDescriptor::new(
        "prod",
        Endpoint {
            server: "https://prod.example.com".into(),
            ..Endpoint::default()
        },
        AuthMode::ExecAws { exec: exec("aws") },
    )
}

fn mode(path: &Path) -> u32 {
    fs::metadata(path).unwrap().permissions().mode() & 0o777
}

#[tokio::test]
async fn writes_aws_credentials_in_the_user_namespace() {
    let fx = fixture(ok_runner(), Duration::from_secs(5));
    let alice = UserId::new("alice");
    let desc = prod();
    fx.materializer
        .store(&alice, desc.id, AWS_CREDENTIALS.as_bytes())
        .await
        .unwrap();

    let materialized = fx
        .materializer
        .materialize(&alice, &desc)
        .await
        .unwrap()
        .expect("exec-aws clusters materialize");

    let ns = fx.store.storage_namespace(&alice).await.unwrap();
    let user_dir = fx.root.join(ns.to_string());
    assert_eq!(materialized.provider, Provider::Aws);
    assert_eq!(materialized.path, user_dir.join("aws/credentials"));
    assert_eq!(
        fs::read_to_string(&materialized.path).unwrap(),
        AWS_CREDENTIALS
    );
    assert_eq!(
        materialized.env.get("AWS_SHARED_CREDENTIALS_FILE"),
        materialized.path.to_str()
    );
    assert_eq!(
        materialized.env.get("AWS_CONFIG_FILE"),
        user_dir.join("aws/config").to_str()
    );

    assert_eq!(mode(&user_dir), 0o711);
    assert_eq!(mode(&user_dir.join("aws")), 0o711);
    assert_eq!(mode(&materialized.path), 0o644);

    // No temporary files are left behind.
    let mut names = fs::read_dir(user_dir.join("aws"))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect::<Vec<_>>();
    names.sort();
    assert_eq!(names, vec!["config", "credentials"]);
}

#[tokio::test]
async fn git_helper_credentials_have_their_own_path() {
    let fx = fixture(ok_runner(), Duration::from_secs(5));
    let alice = UserId::new("alice");
    let desc = ClusterDescriptor::new(
        "dev",
        Endpoint {
            server: "https://dev.example.com".into(),
            ..Endpoint::default()
        },
        AuthMode::ExecGitHelper {
            exec: exec("kube-git-helper"),
        },
    );
    fx.materializer
        .store(&alice, desc.id, b"ghp_0123456789abcdef")
        .await
        .unwrap();

    let materialized = fx
        .materializer
        .materialize(&alice, &desc)
        .await
        .unwrap()
        .unwrap();
    assert!(materialized.path.ends_with("git-helper/credentials"));
    assert_eq!(
        materialized.env.get("KUBEDECK_HELPER_CREDENTIALS"),
        materialized.path.to_str()
    );
}

#[tokio::test]
async fn missing_credentials_fail() {
    let fx = fixture(ok_runner(), Duration::from_secs(5));
    let err = fx
        .materializer
        .materialize(&UserId::new("alice"), &prod())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CredentialMissing { ref cluster } if cluster == "prod"));
    assert!(fx.runner.calls.lock().is_empty());
}

#[tokio::test]
async fn undecryptable_credentials_fail_closed() {
    let fx = fixture(ok_runner(), Duration::from_secs(5));
    let alice = UserId::new("alice");
    let desc = prod();
    let foreign = SecretStore::new(SecretKey::from_passphrase("other"))
        .seal(b"secret")
        .unwrap();
    fx.store
        .put_credential(&UserClusterCredential::new(alice.clone(), desc.id, foreign))
        .await
        .unwrap();

    let err = fx.materializer.validate(&alice, &desc).await.unwrap_err();
    assert!(matches!(err, Error::Decryption(_)));
    assert!(fx.runner.calls.lock().is_empty());
}

#[tokio::test]
async fn non_exec_modes_need_nothing() {
    let fx = fixture(ok_runner(), Duration::from_secs(5));
    let desc = ClusterDescriptor::new("local", Endpoint::default(), AuthMode::InProcess);
    let alice = UserId::new("alice");
    assert_eq!(fx.materializer.materialize(&alice, &desc).await.unwrap(), None);
    assert!(fx.materializer.validate(&alice, &desc).await.unwrap().is_empty());
}

#[tokio::test]
async fn validation_passes_paths_not_secrets() {
    let fx = fixture(ok_runner(), Duration::from_secs(5));
    let alice = UserId::new("alice");
    let desc = prod();
    fx.materializer
        .store(&alice, desc.id, AWS_CREDENTIALS.as_bytes())
        .await
        .unwrap();

    let env = fx.materializer.validate(&alice, &desc).await.unwrap();
    assert!(env.get("AWS_SHARED_CREDENTIALS_FILE").is_some());

    let calls = fx.runner.calls.lock().clone();
    assert_eq!(calls.len(), 1);
    let (exec, overlay) = &calls[0];
    assert_eq!(overlay, &env);
    for arg in exec
        .args
        .iter()
        .map(String::as_str)
        .chain(overlay.iter().map(|(_, v)| v))
    {
        assert!(!arg.contains("wJalrXUtnFEMIEXAMPLE"), "{arg}");
    }

    let stored = fx
        .store
        .get_credential(&alice, desc.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.validation, Validation::Valid);
}

#[tokio::test]
async fn helper_failures_are_redacted_and_recorded() {
    let runner = FakeRunner {
        output: Mutex::new(HelperOutput {
            success: false,
            stdout: vec![],
            stderr: b"An error occurred (InvalidClientTokenId): key AKIAEXAMPLEKEY is invalid\n"
                .to_vec(),
        }),
        ..FakeRunner::default()
    };
    let fx = fixture(runner, Duration::from_secs(5));
    let alice = UserId::new("alice");
    let desc = prod();
    fx.materializer
        .store(&alice, desc.id, AWS_CREDENTIALS.as_bytes())
        .await
        .unwrap();

    let err = fx.materializer.validate(&alice, &desc).await.unwrap_err();
    let Error::ProviderAuth { provider, output } = err else {
        panic!("expected a provider error");
    };
    assert_eq!(provider, Provider::Aws);
    assert!(output.contains("InvalidClientTokenId"), "{output}");
    assert!(!output.contains("AKIAEXAMPLEKEY"), "{output}");

    let stored = fx
        .store
        .get_credential(&alice, desc.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.validation, Validation::Invalid);

    // The file is kept for reuse.
    assert!(fx
        .materializer
        .user_dir(&alice)
        .await
        .unwrap()
        .join("aws/credentials")
        .exists());
}

#[tokio::test]
async fn slow_helpers_time_out() {
    let runner = FakeRunner {
        delay: Duration::from_secs(30),
        ..ok_runner()
    };
    let fx = fixture(runner, Duration::from_millis(50));
    let alice = UserId::new("alice");
    let desc = prod();
    fx.materializer
        .store(&alice, desc.id, AWS_CREDENTIALS.as_bytes())
        .await
        .unwrap();

    let err = fx.materializer.validate(&alice, &desc).await.unwrap_err();
    assert!(matches!(err, Error::ProviderAuth { .. }), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn materialization_is_serialized_per_user_and_provider() {
    let runner = FakeRunner {
        delay: Duration::from_millis(50),
        ..ok_runner()
    };
    let fx = Arc::new(fixture(runner, Duration::from_secs(5)));
    let alice = UserId::new("alice");
    let desc = prod();
    fx.materializer
        .store(&alice, desc.id, AWS_CREDENTIALS.as_bytes())
        .await
        .unwrap();

    let tasks = (0..4)
        .map(|_| {
            let fx = fx.clone();
            let alice = alice.clone();
            let desc = desc.clone();
            tokio::spawn(async move { fx.materializer.validate(&alice, &desc).await })
        })
        .collect::<Vec<_>>();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(fx.runner.calls.lock().len(), 4);
    assert_eq!(fx.runner.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_users_materialize_concurrently() {
    let runner = FakeRunner {
        delay: Duration::from_millis(200),
        ..ok_runner()
    };
    let fx = Arc::new(fixture(runner, Duration::from_secs(5)));
    let desc = prod();
    for user in ["alice", "bob"] {
        fx.materializer
            .store(&user.into(), desc.id, AWS_CREDENTIALS.as_bytes())
            .await
            .unwrap();
    }

    let tasks = ["alice", "bob"]
        .into_iter()
        .map(|user| {
            let fx = fx.clone();
            let desc = desc.clone();
            tokio::spawn(async move { fx.materializer.validate(&user.into(), &desc).await })
        })
        .collect::<Vec<_>>();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(fx.runner.max_active.load(Ordering::SeqCst), 2);
}

#[test]
fn redaction_removes_secret_tokens() {
    let secret = SecretStore::new(SecretKey::from_passphrase("k"));
    let plaintext = secret
        .open(&secret.seal(AWS_CREDENTIALS.as_bytes()).unwrap())
        .unwrap();

    let out = redact(
        b"using key AKIAEXAMPLEKEY with secret wJalrXUtnFEMIEXAMPLE: denied",
        &plaintext,
    );
    assert_eq!(out, "using key [redacted] with secret [redacted]: denied");

    let long = vec![b'x'; MAX_OUTPUT * 2];
    assert_eq!(redact(&long, &plaintext).len(), MAX_OUTPUT);
}

#[tokio::test]
async fn process_runner_passes_the_overlay() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("credentials");
    fs::write(&path, "token-from-file").unwrap();
    let env = EnvOverlay::from_iter([("KUBEDECK_HELPER_CREDENTIALS", path.to_str().unwrap())]);

    let exec = ExecSpec {
        api_version: "client.authentication.k8s.io/v1beta1".into(),
        command: "sh".into(),
        args: vec!["-c".into(), "cat \"$KUBEDECK_HELPER_CREDENTIALS\"".into()],
        env: Default::default(),
    };
    let out = ProcessRunner::default().run(&exec, &env).await.unwrap();
    assert!(out.success);
    assert_eq!(out.stdout, b"token-from-file");

    let exec = ExecSpec {
        args: vec!["-c".into(), "echo denied >&2; exit 3".into()],
        ..exec
    };
    let out = ProcessRunner::default().run(&exec, &env).await.unwrap();
    assert!(!out.success);
    assert_eq!(out.stderr, b"denied\n");
}
