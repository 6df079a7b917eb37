//! A single-node Mastodon instance: PostgreSQL, Redis, the web, streaming
//! and sidekiq processes, a one-off shell container that sets up the
//! database, and Caddy in front of it all.
use std::time::Duration;

use camino::Utf8PathBuf;

use crate::blueprint::Blueprint;
use crate::error::StackError;
use crate::model::{HealthProbe, RestartPolicy, ServiceUnit};
use crate::registry::ResourceHandle;
use crate::secret::{Command, Generator, RandomHex, SecretMaterial};
use crate::value::{Value, combine};

const MASTODON_IMAGE: &str = "tootsuite/mastodon:v3.5.3";
const POSTGRES_IMAGE: &str = "postgres:14-alpine";
const REDIS_IMAGE: &str = "redis:7-alpine";
const CADDY_IMAGE: &str = "caddy:2.6.2-alpine";

const VAPID_PRIVATE: &str = r#"openssl ecparam -name prime256v1 -genkey -noout -out vapid_private_key.pem &&
openssl ec -in vapid_private_key.pem -pubout -noout -out vapid_public_key.pem >/dev/null 2>&1 &&
sed -e "1 d" -e "$ d" vapid_private_key.pem | tr -d "\n"; echo"#;

const VAPID_PUBLIC: &str = r#"sed -e "1 d" -e "$ d" vapid_public_key.pem | tr -d "\n"; echo"#;

/// Configuration of [`define`].
pub struct MastodonArgs {
    pub local_domain: Value<String>,
    /// Host path of the Caddyfile mounted into the proxy.
    pub caddyfile: Utf8PathBuf,
    pub otp_secret: Box<dyn Generator>,
    pub secret_key_base: Box<dyn Generator>,
    /// Runs before the public key generator, which may read what it left
    /// behind.
    pub vapid_private_key: Box<dyn Generator>,
    pub vapid_public_key: Box<dyn Generator>,
}

impl MastodonArgs {
    /// Secrets are 64 random bytes, the VAPID key pair is made by `openssl`
    /// in the working directory.
    pub fn new(local_domain: impl Into<Value<String>>) -> Self {
        Self {
            local_domain: local_domain.into(),
            caddyfile: "/tmp/Caddyfile".into(),
            otp_secret: Box::new(RandomHex::new(64)),
            secret_key_base: Box::new(RandomHex::new(64)),
            vapid_private_key: Box::new(Command::new(VAPID_PRIVATE).delete("rm vapid_private_key.pem")),
            vapid_public_key: Box::new(Command::new(VAPID_PUBLIC).delete("rm vapid_public_key.pem")),
        }
    }

    pub fn caddyfile(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.caddyfile = path.into();
        self
    }

    pub fn vapid(mut self, private: impl Generator + 'static, public: impl Generator + 'static) -> Self {
        self.vapid_private_key = Box::new(private);
        self.vapid_public_key = Box::new(public);
        self
    }
}

struct Boxed(Box<dyn Generator>);

impl Generator for Boxed {
    fn generate(&self, name: &str) -> anyhow::Result<SecretMaterial> {
        self.0.generate(name)
    }

    fn destroy(&self, material: &SecretMaterial) -> anyhow::Result<()> {
        self.0.destroy(material)
    }
}

/// Handles of the services of one instance.
#[derive(Debug, Clone)]
pub struct Mastodon {
    pub network: ResourceHandle,
    pub external_network: ResourceHandle,
    pub postgres: ResourceHandle,
    pub redis: ResourceHandle,
    pub web: ResourceHandle,
    pub streaming: ResourceHandle,
    pub sidekiq: ResourceHandle,
    pub shell: ResourceHandle,
    pub caddy: ResourceHandle,
}

fn exposed(material: Value<SecretMaterial>) -> Value<String> {
    material.map(|material| material.expose().to_string())
}

fn image(blueprint: &mut Blueprint, name: &str, reference: &str) -> Result<Value<String>, StackError> {
    blueprint.define_image(name, reference)?.output("image_id")
}

/// Registers an instance named `name` on `blueprint`.
///
/// Exports the names of both networks as `network` and `external-network`
/// and the secret key base as `secret-key-base`.
pub fn define(blueprint: &mut Blueprint, name: &str, args: MastodonArgs) -> Result<Mastodon, StackError> {
    let otp_secret = blueprint.generate_once("otp-secret", Boxed(args.otp_secret))?;
    let secret_key_base = blueprint.generate_once("secret-key-base", Boxed(args.secret_key_base))?;
    let vapid_private_key = blueprint.generate_once("vapid-private-key", Boxed(args.vapid_private_key))?;
    let vapid_public_key = blueprint.generate_once("vapid-public-key", Boxed(args.vapid_public_key))?;

    if let (Some(public), Some(private)) = (
        blueprint.handle("vapid-public-key").cloned(),
        blueprint.handle("vapid-private-key").cloned(),
    ) {
        blueprint.depends_on(&public, &private)?;
    }

    let network = blueprint.define_network(format!("{name}-network"), true)?;
    let external_network = blueprint.define_network(format!("{name}-external-network"), false)?;

    let postgres_image = image(blueprint, &format!("{name}-postgres-image"), POSTGRES_IMAGE)?;
    let postgres_volume = blueprint.define_volume(format!("{name}-postgres-volume"))?;
    let postgres = ServiceUnit::new(format!("{name}-postgres-container"), postgres_image)
        .restart(RestartPolicy::UnlessStopped)
        .shm_size(256)
        .network(&network)
        .probe(HealthProbe::cmd(["pg_isready", "-U", "postgres"]))
        .volume(&postgres_volume, "/var/lib/postgresql/data")
        .env("POSTGRES_HOST_AUTH_METHOD", "trust");
    let postgres = blueprint.define_service(postgres, &[])?;

    let redis_image = image(blueprint, &format!("{name}-redis-image"), REDIS_IMAGE)?;
    let redis_volume = blueprint.define_volume(format!("{name}-redis-volume"))?;
    let redis = ServiceUnit::new(format!("{name}-redis-container"), redis_image)
        .restart(RestartPolicy::UnlessStopped)
        .network(&network)
        .probe(HealthProbe::cmd(["redis-cli", "ping"]))
        .volume(&redis_volume, "/data");
    let redis = blueprint.define_service(redis, &[])?;

    let mastodon_image = image(blueprint, &format!("{name}-mastodon-image"), MASTODON_IMAGE)?;
    let mastodon_volume = blueprint.define_volume(format!("{name}-mastodon-volume"))?;

    let env: Vec<(&str, Value<String>)> = vec![
        ("LOCAL_DOMAIN", args.local_domain),
        ("SINGLE_USER_MODE", "false".into()),
        ("VAPID_PRIVATE_KEY", exposed(vapid_private_key)),
        ("VAPID_PUBLIC_KEY", exposed(vapid_public_key)),
        ("OTP_SECRET", exposed(otp_secret)),
        ("SECRET_KEY_BASE", exposed(secret_key_base.clone())),
        ("DB_HOST", postgres.output("host")?),
        ("DB_PORT", "5432".into()),
        ("DB_NAME", "postgres".into()),
        ("DB_USER", "postgres".into()),
        ("DB_PASS", "".into()),
        ("REDIS_HOST", redis.output("host")?),
        ("REDIS_PORT", "6379".into()),
        ("REDIS_PASS", "".into()),
    ];

    let databases = [&postgres, &redis];
    let interval = Duration::from_secs(30);

    let web = ServiceUnit::new(format!("{name}-mastodon-container"), mastodon_image.clone())
        .restart(RestartPolicy::UnlessStopped)
        .envs(env.clone())
        .port(3000, 3000)
        .command([
            "bash",
            "-c",
            "rm -f /mastodon/tmp/pids/server.pid; bundle exec rails s -p 3000",
        ])
        .probe(
            HealthProbe::shell("wget -q --spider --proxy=off localhost:3000/health || exit 1")
                .interval(interval),
        )
        .network(&network)
        .network_with_aliases(&external_network, ["mastodon"])
        .volume(&mastodon_volume, "/mastodon/public/system");
    let web = blueprint.define_service(web, &databases)?;

    let streaming = ServiceUnit::new(format!("{name}-streaming-container"), mastodon_image.clone())
        .restart(RestartPolicy::UnlessStopped)
        .envs(env.clone())
        .command(["node", "./streaming"])
        .port(4000, 4000)
        .network(&network)
        .network_with_aliases(&external_network, ["mastodon-streaming"])
        .probe(
            HealthProbe::shell(
                "wget -q --spider --proxy=off localhost:4000/api/v1/streaming/health || exit 1",
            )
            .interval(interval),
        );
    let streaming = blueprint.define_service(streaming, &databases)?;

    let sidekiq = ServiceUnit::new(format!("{name}-sidekiq-container"), mastodon_image.clone())
        .restart(RestartPolicy::UnlessStopped)
        .envs(env.clone())
        .command(["bundle", "exec", "sidekiq"])
        .network(&network)
        .network(&external_network)
        .volume(&mastodon_volume, "/mastodon/public/system")
        .probe(HealthProbe::shell("ps aux | grep '[s]idekiq\\ 6' || false"));
    let sidekiq = blueprint.define_service(sidekiq, &databases)?;

    let shell = ServiceUnit::new(format!("{name}-shell"), mastodon_image)
        .restart(RestartPolicy::No)
        .envs(env)
        .command([
            "/bin/bash",
            "-c",
            "RAILS_ENV=production rails db:setup && while true; do sleep 1; done",
        ])
        .network(&network)
        .network(&external_network)
        .volume(&mastodon_volume, "/mastodon/public/system");
    let shell = blueprint.define_service(shell, &databases)?;

    let caddy_image = image(blueprint, &format!("{name}-caddy-image"), CADDY_IMAGE)?;
    let caddy = ServiceUnit::new(format!("{name}-caddy-container"), caddy_image)
        .restart(RestartPolicy::UnlessStopped)
        .port(80, 80)
        .port(443, 443)
        .network(&network)
        .network(&external_network)
        .bind(args.caddyfile, "/etc/caddy/Caddyfile");
    let caddy = blueprint.define_service(caddy, &[])?;

    blueprint.export("network", network.output("name")?)?;
    blueprint.export("external-network", external_network.output("name")?)?;
    blueprint.export(
        "secret-key-base",
        combine(secret_key_base, |material| Ok(material.expose().to_string())),
    )?;

    Ok(Mastodon {
        network,
        external_network,
        postgres,
        redis,
        web,
        streaming,
        sidekiq,
        shell,
        caddy,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{Event, MemoryProvisioner, Properties, Settings, State};

    fn fake_vapid(prefix: &'static str) -> impl Generator {
        move |_: &str| -> anyhow::Result<SecretMaterial> { Ok(SecretMaterial::new(format!("{prefix}-key"))) }
    }

    fn args() -> MastodonArgs {
        MastodonArgs::new("social.example").vapid(fake_vapid("private"), fake_vapid("public"))
    }

    fn properties(provisioner: &MemoryProvisioner, name: &str) -> Properties {
        provisioner.request(name).unwrap().properties
    }

    #[test]
    fn whole_stack_is_provisioned() {
        let provisioner = MemoryProvisioner::new();
        let mut blueprint =
            Blueprint::new("social").with_settings(Settings::default().progress(false));
        let stack = define(&mut blueprint, "toot", args()).unwrap();

        let deployment = blueprint.plan(&provisioner).unwrap();

        // 4 secrets, 2 networks, 4 images, 3 volumes, 7 services
        assert_eq!(deployment.created().len(), 20);
        assert_eq!(deployment.state(stack.caddy.name()), Some(State::Resolved));

        let Properties::Service(web) = properties(&provisioner, "toot-mastodon-container") else {
            panic!("expected a service");
        };
        assert_eq!(web.env["DB_HOST"].expose(), "toot-postgres-container");
        assert_eq!(web.env["REDIS_HOST"].expose(), "toot-redis-container");
        assert_eq!(web.env["VAPID_PUBLIC_KEY"].expose(), "public-key");
        assert!(web.env["OTP_SECRET"].is_secret());
        assert!(!web.env["LOCAL_DOMAIN"].is_secret());
        assert_eq!(web.networks[1].aliases, ["mastodon"]);
        assert!(web.image.starts_with("sha256:"));

        let exports = deployment.exports();
        assert_eq!(exports["network"].expose().unwrap(), "toot-network");
        assert!(exports["secret-key-base"].is_secret());
        assert_eq!(exports["secret-key-base"].expose().unwrap().len(), 128);
    }

    #[test]
    fn databases_come_up_before_their_consumers() {
        let provisioner = MemoryProvisioner::new();
        let mut blueprint =
            Blueprint::new("social").with_settings(Settings::default().progress(false));
        define(&mut blueprint, "toot", args()).unwrap();
        blueprint.plan(&provisioner).unwrap();

        let events = provisioner.events();
        let position = |event: Event| events.iter().position(|e| *e == event).unwrap();

        for consumer in ["mastodon", "streaming", "sidekiq"] {
            let submitted = position(Event::Submitted(format!("toot-{consumer}-container")));
            assert!(position(Event::Created("toot-postgres-container".into())) < submitted);
            assert!(position(Event::Created("toot-redis-container".into())) < submitted);
        }
    }

    #[test]
    fn vapid_keys_are_generated_in_order() {
        let order = Arc::new(AtomicUsize::new(0));
        let (first, second) = (order.clone(), order.clone());

        let private = move |_: &str| -> anyhow::Result<SecretMaterial> {
            assert_eq!(first.fetch_add(1, Ordering::SeqCst), 0);
            Ok(SecretMaterial::new("private"))
        };
        let public = move |_: &str| -> anyhow::Result<SecretMaterial> {
            assert_eq!(second.fetch_add(1, Ordering::SeqCst), 1);
            Ok(SecretMaterial::new("public"))
        };

        let mut blueprint =
            Blueprint::new("social").with_settings(Settings::default().progress(false));
        define(&mut blueprint, "toot", MastodonArgs::new("x").vapid(private, public)).unwrap();
        blueprint.plan(MemoryProvisioner::new()).unwrap();

        assert_eq!(order.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn teardown_removes_everything() {
        let provisioner = MemoryProvisioner::new();
        let mut blueprint = Blueprint::new("social")
            .with_settings(Settings::default().sequential().progress(false));
        define(&mut blueprint, "toot", args()).unwrap();

        let deployment = blueprint.plan(&provisioner).unwrap();
        deployment.destroy(&provisioner).unwrap();

        assert!(provisioner.live().is_empty());
        assert_eq!(provisioner.destroyed().last().unwrap(), "toot-network");
    }
}
