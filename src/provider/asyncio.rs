use async_trait::async_trait;

use crate::provider::{CreateRequest, Provisioned, Provisioner};

/// A provisioner whose backing API is asynchronous.
///
/// Wrap it in [`Blocking`] to hand it to a plan pass.
#[async_trait]
pub trait AsyncProvisioner: Send + Sync {
    async fn create(&self, request: &CreateRequest) -> anyhow::Result<Provisioned>;

    async fn destroy(&self, resource: &Provisioned) -> anyhow::Result<()>;
}

/// Drives an [`AsyncProvisioner`] to completion on its own tokio runtime.
///
/// Plan workers are plain threads, each call blocks the calling worker until
/// the future resolves.
pub struct Blocking<P> {
    inner: P,
    tokio: tokio::runtime::Runtime,
}

impl<P: AsyncProvisioner> Blocking<P> {
    pub fn new(inner: P) -> anyhow::Result<Self> {
        let tokio = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("kumiki-provisioner")
            .build()?;

        Ok(Self { inner, tokio })
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<P: AsyncProvisioner> Provisioner for Blocking<P> {
    fn create(&self, request: &CreateRequest) -> anyhow::Result<Provisioned> {
        self.tokio.block_on(self.inner.create(request))
    }

    fn destroy(&self, resource: &Provisioned) -> anyhow::Result<()> {
        self.tokio.block_on(self.inner.destroy(resource))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::{Blueprint, Settings};

    #[derive(Default)]
    struct Remote {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AsyncProvisioner for Remote {
        async fn create(&self, request: &CreateRequest) -> anyhow::Result<Provisioned> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.calls.lock().unwrap().push(format!("create {}", request.name));

            let mut provisioned = Provisioned::new(request, format!("remote-{}", request.name));
            for field in request.kind.fields() {
                provisioned = provisioned.output(*field, format!("{}-{field}", request.name));
            }
            Ok(provisioned)
        }

        async fn destroy(&self, resource: &Provisioned) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("destroy {}", resource.name));
            Ok(())
        }
    }

    #[test]
    fn blocking_adapter_plans_and_destroys() {
        let provisioner = Blocking::new(Remote::default()).unwrap();

        let mut blueprint = Blueprint::new("remote").with_settings(Settings::default().progress(false));
        let net = blueprint.define_network("net", false).unwrap();
        blueprint.define_volume("data").unwrap();
        blueprint.export("net", net.output("name").unwrap()).unwrap();

        let deployment = blueprint.plan(&provisioner).unwrap();
        assert_eq!(deployment.exports()["net"].expose().unwrap(), "net-name");

        deployment.destroy(&provisioner).unwrap();

        let calls = provisioner.inner().calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        assert!(calls[2].starts_with("destroy"));
    }
}
