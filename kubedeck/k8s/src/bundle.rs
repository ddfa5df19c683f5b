//! Parses multi-context kubeconfig bundles into cluster descriptors.

use crate::kubeconfig::{Exec, Kubeconfig, User};
use kubedeck_core::{AuthMode, ClusterDescriptor, Endpoint, Error, ExecSpec, Result, SecretStore};
use std::path::Path;
use tracing::{debug, warn};

/// Exec commands backed by AWS credentials.
const AWS_COMMANDS: &[&str] = &["aws", "aws-iam-authenticator"];

/// Returns one descriptor per context in the bundle. Contexts whose user
/// authenticates in a way kubedeck doesn't support are skipped.
///
/// Static tokens are sealed before they leave this function. The
/// bundle's current context, if any, is marked as the default.
pub fn parse(bytes: &[u8], secrets: &SecretStore) -> Result<Vec<ClusterDescriptor>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| Error::InvalidBundle("bundle is not valid UTF-8".into()))?;
    let kubeconfig = Kubeconfig::from_yaml(text)?;
    if kubeconfig.contexts.is_empty() {
        return Err(Error::InvalidBundle("bundle has no contexts".into()));
    }

    let mut descriptors = Vec::with_capacity(kubeconfig.contexts.len());
    for named in &kubeconfig.contexts {
        let name = named.name.trim();
        let Some(cluster) = kubeconfig.cluster(&named.context.cluster) else {
            return Err(Error::InvalidBundle(format!(
                "context {name} references unknown cluster {}",
                named.context.cluster
            )));
        };

        let auth = match kubeconfig.user(&named.context.user) {
            Some(user) => match auth_mode(user, secrets)? {
                Some(auth) => auth,
                None => {
                    warn!(context = %name, "Skipping context with unsupported authentication");
                    continue;
                }
            },
            None => {
                warn!(context = %name, user = %named.context.user, "Skipping context without a user");
                continue;
            }
        };

        let mut desc = ClusterDescriptor::new(
            name,
            Endpoint {
                server: cluster.server.clone(),
                certificate_authority_data: cluster.certificate_authority_data.clone(),
                insecure_skip_tls_verify: cluster.insecure_skip_tls_verify.unwrap_or(false),
            },
            auth,
        );
        desc.default = kubeconfig.current_context.as_deref() == Some(named.name.as_str());
        desc.validate()
            .map_err(|e| Error::InvalidBundle(format!("context {name}: {e}")))?;
        debug!(context = %name, auth = desc.auth.name(), "Parsed context");
        descriptors.push(desc);
    }

    Ok(descriptors)
}

fn auth_mode(user: &User, secrets: &SecretStore) -> Result<Option<AuthMode>> {
    if let Some(token) = user.token.as_deref() {
        let token = secrets.seal(token.trim().as_bytes())?;
        return Ok(Some(AuthMode::Token { token }));
    }
    if let Some(exec) = &user.exec {
        let spec = exec_spec(exec);
        let auth = if is_aws(&exec.command) {
            AuthMode::ExecAws { exec: spec }
        } else {
            AuthMode::ExecGitHelper { exec: spec }
        };
        return Ok(Some(auth));
    }
    // Client certificates, auth providers and basic auth are not supported.
    Ok(None)
}

fn exec_spec(exec: &Exec) -> ExecSpec {
    ExecSpec {
        api_version: exec.api_version.clone(),
        command: exec.command.clone(),
        args: exec.args.clone(),
        env: exec
            .env
            .iter()
            .map(|e| (e.name.clone(), e.value.clone()))
            .collect(),
    }
}

fn is_aws(command: &str) -> bool {
    Path::new(command)
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| AWS_COMMANDS.contains(&n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubedeck_core::SecretKey;

    const BUNDLE: &str = r#"
apiVersion: v1
kind: Config
current-context: staging
clusters:
  - name: prod-cluster
    cluster:
      server: https://prod.example.com
      certificate-authority-data: Y2EK
  - name: staging-cluster
    cluster:
      server: https://staging.example.com
      insecure-skip-tls-verify: true
  - name: dev-cluster
    cluster:
      server: https://dev.example.com
users:
  - name: eks
    user:
      exec:
        apiVersion: client.authentication.k8s.io/v1beta1
        command: /usr/local/bin/aws
        args: [eks, get-token, --cluster-name, prod]
        env:
          - name: AWS_PROFILE
            value: prod
  - name: token
    user:
      token: s3cr3t-t0ken
  - name: helper
    user:
      exec:
        command: kube-git-helper
  - name: cert
    user:
      client-certificate-data: Y2VydAo=
      client-key-data: a2V5Cg==
contexts:
  - name: prod
    context: { cluster: prod-cluster, user: eks }
  - name: staging
    context: { cluster: staging-cluster, user: token, namespace: web }
  - name: dev
    context: { cluster: dev-cluster, user: helper }
  - name: legacy
    context: { cluster: dev-cluster, user: cert }
"#;

    fn secrets() -> SecretStore {
        SecretStore::new(SecretKey::from_passphrase("bundle"))
    }

    #[test]
    fn classifies_each_context() {
        let secrets = secrets();
        let clusters = parse(BUNDLE.as_bytes(), &secrets).unwrap();
        let names = clusters.iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["prod", "staging", "dev"]);

        let prod = &clusters[0];
        let AuthMode::ExecAws { exec } = &prod.auth else {
            panic!("expected exec-aws, got {:?}", prod.auth);
        };
        assert_eq!(exec.args, vec!["eks", "get-token", "--cluster-name", "prod"]);
        assert_eq!(exec.env.get("AWS_PROFILE").map(String::as_str), Some("prod"));
        assert_eq!(prod.endpoint.certificate_authority_data.as_deref(), Some("Y2EK"));
        assert!(!prod.default);

        let staging = &clusters[1];
        let AuthMode::Token { token } = &staging.auth else {
            panic!("expected a token, got {:?}", staging.auth);
        };
        assert_eq!(secrets.open(token).unwrap().as_str(), Some("s3cr3t-t0ken"));
        assert!(staging.endpoint.insecure_skip_tls_verify);
        assert!(staging.default);

        assert!(matches!(clusters[2].auth, AuthMode::ExecGitHelper { .. }));
    }

    #[test]
    fn rejects_malformed_bundles() {
        let secrets = secrets();
        for bundle in [
            &b"\xff\xfe"[..],
            b"clusters: [",
            b"apiVersion: v1\nkind: Config\n",
        ] {
            assert!(
                matches!(parse(bundle, &secrets), Err(Error::InvalidBundle(_))),
                "{}",
                String::from_utf8_lossy(bundle)
            );
        }
    }

    #[test]
    fn rejects_dangling_cluster_references() {
        let bundle = r#"
contexts:
  - name: prod
    context: { cluster: missing, user: token }
users:
  - name: token
    user: { token: abc }
"#;
        assert!(matches!(
            parse(bundle.as_bytes(), &secrets()),
            Err(Error::InvalidBundle(_))
        ));
    }

    #[test]
    fn recognizes_aws_commands_by_basename() {
        assert!(is_aws("aws"));
        assert!(is_aws("/opt/bin/aws-iam-authenticator"));
        assert!(!is_aws("aws-vault"));
        assert!(!is_aws("gke-gcloud-auth-plugin"));
    }
}
