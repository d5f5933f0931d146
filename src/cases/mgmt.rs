//! Management API cases: secrets, login, bootstrap queries, website settings
//! and certificates.

use async_trait::async_trait;
use tracing::info;

use super::{Case, Harness, Verdict};
use crate::api::types::{
    paths, Beian, BeianUpdate, BilibiliQuery, BilibiliVideo, CertConfig, Check, Envs, Init,
    LetsEncrypt, Login, PublishSecret, SecretUpdate, SslUpdate, Token, Versions,
};
use crate::cert::{generate_self_signed, DEFAULT_COMMON_NAME};
use crate::context::RunContext;
use crate::error::HarnessError;
use crate::task::ErrorSlots;

fn invalid<T: std::fmt::Debug>(res: &T) -> HarnessError {
    HarnessError::assertion(format!("invalid response {:?}", res))
}

pub struct Empty;

#[async_trait]
impl Case for Empty {
    fn name(&self) -> &'static str {
        "empty"
    }

    async fn run(&self, _harness: &Harness, _ctx: &RunContext) -> Result<Verdict, HarnessError> {
        Ok(Verdict::Pass)
    }
}

pub struct Ready;

#[async_trait]
impl Case for Ready {
    fn name(&self) -> &'static str {
        "ready"
    }

    async fn run(&self, harness: &Harness, ctx: &RunContext) -> Result<Verdict, HarnessError> {
        let versions = harness.api().wait_ready(ctx).await?;
        info!(version = %versions.version, "server ready");
        Ok(Verdict::Pass)
    }
}

pub struct QueryPublishSecret;

#[async_trait]
impl Case for QueryPublishSecret {
    fn name(&self) -> &'static str {
        "query_publish_secret"
    }

    async fn run(&self, harness: &Harness, ctx: &RunContext) -> Result<Verdict, HarnessError> {
        if harness.publish_secret(ctx).await?.is_empty() {
            return Err(HarnessError::assertion("empty publish secret"));
        }
        Ok(Verdict::Pass)
    }
}

pub struct LoginByPassword;

#[async_trait]
impl Case for LoginByPassword {
    fn name(&self) -> &'static str {
        "login_by_password"
    }

    async fn run(&self, harness: &Harness, ctx: &RunContext) -> Result<Verdict, HarnessError> {
        let login = Login {
            password: harness.config().auth.system_password.clone(),
        };
        let token: Token = harness.api().request(ctx, paths::LOGIN, Some(&login)).await?;
        if token.token.is_empty() {
            return Err(HarnessError::assertion("empty token"));
        }
        Ok(Verdict::Pass)
    }
}

pub struct BootstrapQueryEnvs;

#[async_trait]
impl Case for BootstrapQueryEnvs {
    fn name(&self) -> &'static str {
        "bootstrap_query_envs"
    }

    async fn run(&self, harness: &Harness, ctx: &RunContext) -> Result<Verdict, HarnessError> {
        let res: Envs = harness.api().query(ctx, paths::ENVS).await?;
        if !res.mgmt_docker {
            return Err(invalid(&res));
        }
        Ok(Verdict::Pass)
    }
}

pub struct BootstrapQueryInit;

#[async_trait]
impl Case for BootstrapQueryInit {
    fn name(&self) -> &'static str {
        "bootstrap_query_init"
    }

    async fn run(&self, harness: &Harness, ctx: &RunContext) -> Result<Verdict, HarnessError> {
        let res: Init = harness.api().query(ctx, paths::INIT).await?;
        if !res.init {
            return Err(invalid(&res));
        }
        Ok(Verdict::Pass)
    }
}

pub struct BootstrapQueryCheck;

#[async_trait]
impl Case for BootstrapQueryCheck {
    fn name(&self) -> &'static str {
        "bootstrap_query_check"
    }

    async fn run(&self, harness: &Harness, ctx: &RunContext) -> Result<Verdict, HarnessError> {
        let res: Check = harness.api().query(ctx, paths::CHECK).await?;
        if res.upgrading {
            return Err(invalid(&res));
        }
        Ok(Verdict::Pass)
    }
}

pub struct BootstrapQueryVersions;

#[async_trait]
impl Case for BootstrapQueryVersions {
    fn name(&self) -> &'static str {
        "bootstrap_query_versions"
    }

    async fn run(&self, harness: &Harness, ctx: &RunContext) -> Result<Verdict, HarnessError> {
        let res: Versions = harness.api().query(ctx, paths::VERSIONS).await?;
        if res.version.is_empty() {
            return Err(invalid(&res));
        }
        Ok(Verdict::Pass)
    }
}

pub struct SetupWebsiteFooter;

#[async_trait]
impl Case for SetupWebsiteFooter {
    fn name(&self) -> &'static str {
        "setup_website_footer"
    }

    async fn run(&self, harness: &Harness, ctx: &RunContext) -> Result<Verdict, HarnessError> {
        let api = harness.api();
        api.update(ctx, paths::BEIAN_UPDATE, &BeianUpdate::footer("TestFooter"))
            .await?;
        let res: Beian = api.query(ctx, paths::BEIAN_QUERY).await?;
        if res.icp != "TestFooter" {
            return Err(invalid(&res));
        }
        Ok(Verdict::Pass)
    }
}

pub struct SetupWebsiteTitle;

#[async_trait]
impl Case for SetupWebsiteTitle {
    fn name(&self) -> &'static str {
        "setup_website_title"
    }

    async fn run(&self, harness: &Harness, ctx: &RunContext) -> Result<Verdict, HarnessError> {
        let api = harness.api();
        let before: Beian = api.query(ctx, paths::BEIAN_QUERY).await?;
        let title = if before.title.is_empty() {
            "SRS".to_string()
        } else {
            before.title
        };
        let restore = api.with_restore(
            "website title",
            paths::BEIAN_UPDATE,
            &BeianUpdate::title(title),
            harness.config().suite.restore_timeout(),
        )?;

        let mut slots = ErrorSlots::new();
        let changed = async {
            api.update(ctx, paths::BEIAN_UPDATE, &BeianUpdate::title("TestTitle"))
                .await?;
            let res: Beian = api.query(ctx, paths::BEIAN_QUERY).await?;
            if res.title != "TestTitle" {
                return Err(invalid(&res));
            }
            Ok::<(), HarnessError>(())
        }
        .await;
        slots.record_result("title", changed);
        slots.record_result("restore", restore.run().await);
        slots.finish(ctx).map(|_| Verdict::Pass)
    }
}

/// Changes the publish secret, so it must not run alongside media cases.
pub struct UpdatePublishSecret;

#[async_trait]
impl Case for UpdatePublishSecret {
    fn name(&self) -> &'static str {
        "update_publish_secret"
    }

    async fn run(&self, harness: &Harness, ctx: &RunContext) -> Result<Verdict, HarnessError> {
        let api = harness.api();
        let original = harness.publish_secret(ctx).await?;
        if original.is_empty() {
            return Err(HarnessError::assertion("invalid response, empty publish secret"));
        }
        info!("publish secret will be reset after the case");
        let restore = api.with_restore(
            "publish secret",
            paths::SECRET_UPDATE,
            &SecretUpdate { secret: original },
            harness.config().suite.restore_timeout(),
        )?;

        let mut slots = ErrorSlots::new();
        let changed = async {
            let update = SecretUpdate {
                secret: "TestPublish".to_string(),
            };
            api.update(ctx, paths::SECRET_UPDATE, &update).await?;
            let res: PublishSecret = api.query(ctx, paths::SECRET_QUERY).await?;
            if res.publish != "TestPublish" {
                return Err(invalid(&res));
            }
            Ok::<(), HarnessError>(())
        }
        .await;
        slots.record_result("secret", changed);
        slots.record_result("restore", restore.run().await);
        slots.finish(ctx).map(|_| Verdict::Pass)
    }
}

pub struct TutorialsQueryBilibili;

#[async_trait]
impl Case for TutorialsQueryBilibili {
    fn name(&self) -> &'static str {
        "tutorials_query_bilibili"
    }

    async fn run(&self, harness: &Harness, ctx: &RunContext) -> Result<Verdict, HarnessError> {
        let config = harness.config();
        if !config.suite.domain_lets_encrypt.is_empty() || config.endpoints.https_insecure_verify {
            return Ok(Verdict::skipped("https deployment"));
        }
        if config.suite.no_bilibili_test {
            return Ok(Verdict::skipped("no_bilibili_test"));
        }

        let query = BilibiliQuery {
            bvid: "BV1844y1L7dL".to_string(),
        };
        let res: BilibiliVideo = harness.api().request(ctx, paths::BILIBILI, Some(&query)).await?;
        if res.title.is_empty() || res.desc.is_empty() {
            return Err(invalid(&res));
        }
        Ok(Verdict::Pass)
    }
}

pub struct SslUpdateCert;

#[async_trait]
impl Case for SslUpdateCert {
    fn name(&self) -> &'static str {
        "ssl_update_cert"
    }

    async fn run(&self, harness: &Harness, ctx: &RunContext) -> Result<Verdict, HarnessError> {
        let config = harness.config();
        if !config.suite.domain_lets_encrypt.is_empty() || config.endpoints.https_insecure_verify {
            return Ok(Verdict::skipped("https deployment"));
        }

        let cert = generate_self_signed(DEFAULT_COMMON_NAME)?;
        let api = harness.api();
        let upload = SslUpdate {
            key: cert.key_pem.clone(),
            crt: cert.cert_pem.clone(),
        };
        api.update(ctx, paths::SSL, &upload).await?;

        let conf: CertConfig = api.query(ctx, paths::CERT_QUERY).await?;
        if conf.provider != "ssl" || conf.key != cert.key_pem || conf.crt != cert.cert_pem {
            return Err(HarnessError::assertion(format!(
                "invalid response provider={}, key={}B, crt={}B",
                conf.provider,
                conf.key.len(),
                conf.crt.len()
            )));
        }
        Ok(Verdict::Pass)
    }
}

pub struct LetsEncryptUpdateCert;

#[async_trait]
impl Case for LetsEncryptUpdateCert {
    fn name(&self) -> &'static str {
        "lets_encrypt_update_cert"
    }

    async fn run(&self, harness: &Harness, ctx: &RunContext) -> Result<Verdict, HarnessError> {
        let domain = harness.config().suite.domain_lets_encrypt.clone();
        if domain.is_empty() {
            return Ok(Verdict::skipped("no domain configured"));
        }

        let api = harness.api();
        api.update(ctx, paths::LETS_ENCRYPT, &LetsEncrypt { domain }).await?;
        let conf: CertConfig = api.query(ctx, paths::CERT_QUERY).await?;
        if conf.provider != "lets" || conf.key.is_empty() || conf.crt.is_empty() {
            return Err(HarnessError::assertion(format!(
                "invalid response provider={}, key={}B, crt={}B",
                conf.provider,
                conf.key.len(),
                conf.crt.len()
            )));
        }
        Ok(Verdict::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;

    #[tokio::test]
    async fn test_lets_encrypt_skipped_without_domain() {
        let harness = Harness::new(HarnessConfig::default()).unwrap();
        let ctx = harness.case_context();
        let verdict = LetsEncryptUpdateCert.run(&harness, &ctx).await.unwrap();
        assert!(matches!(verdict, Verdict::Skipped(_)));
    }

    #[tokio::test]
    async fn test_bilibili_skipped_when_disabled() {
        let mut config = HarnessConfig::default();
        config.suite.no_bilibili_test = true;
        let harness = Harness::new(config).unwrap();
        let ctx = harness.case_context();
        let verdict = TutorialsQueryBilibili.run(&harness, &ctx).await.unwrap();
        assert_eq!(verdict, Verdict::skipped("no_bilibili_test"));
    }

    #[tokio::test]
    async fn test_ssl_skipped_for_lets_encrypt() {
        let mut config = HarnessConfig::default();
        config.suite.domain_lets_encrypt = "example.com".to_string();
        let harness = Harness::new(config).unwrap();
        let ctx = harness.case_context();
        let verdict = SslUpdateCert.run(&harness, &ctx).await.unwrap();
        assert!(matches!(verdict, Verdict::Skipped(_)));
    }
}
