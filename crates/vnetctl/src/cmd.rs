use std::sync::Arc;

use nix::fcntl::Flock;
use tracing::info;
use vnet::{Context, Executor, Host, NetError, Pair, Privilege, Scheme, Switch};

use crate::config::VnetConfig;
use crate::error::{CtlError, CtlResult};
use crate::lock;

/// One CLI invocation: configuration plus the reconciliation context built from it.
pub struct Session {
    config: VnetConfig,
    ctx: Context,
    privilege: Privilege,
}

impl Session {
    pub fn new(config: VnetConfig, exec: Arc<dyn Executor>, privilege: Privilege) -> CtlResult<Self> {
        let ctx = Context::new(exec, config.pool()?).with_output_dir(&config.output_dir);
        Ok(Self {
            config,
            ctx,
            privilege,
        })
    }

    async fn lock(&self) -> CtlResult<Flock<std::fs::File>> {
        if let Some(parent) = self.config.state_file.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        lock::acquire(self.config.lock_file()).await
    }

    async fn load(&self) -> CtlResult<Scheme> {
        let path = &self.config.state_file;
        if !tokio::fs::try_exists(path).await? {
            return Err(CtlError::Config(format!(
                "state file not found: {}",
                path.display()
            )));
        }
        Ok(Scheme::load(path).await?)
    }

    async fn load_or_new(&self) -> CtlResult<Scheme> {
        if tokio::fs::try_exists(&self.config.state_file).await? {
            self.load().await
        } else {
            Ok(Scheme::new())
        }
    }

    async fn save(&self, scheme: &Scheme) -> CtlResult<()> {
        scheme.save(&self.config.state_file).await?;
        Ok(())
    }

    /// Reconcile the kernel with the saved topology.
    pub async fn up(&self) -> CtlResult<()> {
        let _lock = self.lock().await?;
        let mut scheme = self.load().await?;
        vnet::check_prerequisites(&scheme, &self.ctx, self.privilege).await?;
        scheme.recover(&self.ctx).await?;
        self.save(&scheme).await?;
        info!(state = %self.config.state_file.display(), "topology is up");
        Ok(())
    }

    /// Tear down every object the saved topology describes.
    pub async fn down(&self) -> CtlResult<()> {
        let _lock = self.lock().await?;
        let mut scheme = self.load().await?;
        scheme.release(&self.ctx).await;
        info!(state = %self.config.state_file.display(), "topology is down");
        Ok(())
    }

    pub async fn add_host(&self, name: &str) -> CtlResult<()> {
        let _lock = self.lock().await?;
        let mut scheme = self.load_or_new().await?;
        scheme.add_host(Host::new(name))?;
        self.save(&scheme).await
    }

    pub async fn add_switch(&self, name: &str, controller: Option<String>) -> CtlResult<()> {
        let _lock = self.lock().await?;
        let mut scheme = self.load_or_new().await?;
        let mut switch = Switch::new(name);
        switch.controller = controller;
        scheme.add_switch(switch)?;
        self.save(&scheme).await
    }

    /// Connect two declared nodes. The topology is recovered first so the
    /// new pair is checked against connections already in place.
    pub async fn connect(&self, left: &str, right: &str) -> CtlResult<Pair> {
        let _lock = self.lock().await?;
        let mut scheme = self.load().await?;
        scheme.recover(&self.ctx).await?;
        let pair = scheme.connect(&self.ctx, left, right).await?;
        self.save(&scheme).await?;
        Ok(pair)
    }

    /// Launch a supervised process inside `host`.
    pub async fn run(&self, host: &str, argv: &[String]) -> CtlResult<(u32, String)> {
        let _lock = self.lock().await?;
        let scheme = self.load().await?;
        let node = scheme
            .host(host)
            .ok_or_else(|| NetError::PeerNotFound(host.to_string()))?;
        node.provision(self.ctx.exec()).await?;
        let pid = node.run_process(&self.ctx, argv).await?;
        let output = node
            .procs()
            .into_iter()
            .find(|p| p.pid == Some(pid))
            .map(|p| p.output)
            .unwrap_or_default();
        self.save(&scheme).await?;
        Ok((pid, output))
    }

    /// The saved topology as pretty JSON.
    pub async fn show(&self) -> CtlResult<String> {
        Ok(self.load().await?.export()?)
    }
}
