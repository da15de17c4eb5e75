use anyhow::Result as AnyhowResult;
use clap::Args;
use tracing::{info, Subscriber};
use tracing_subscriber::{registry::LookupSpan, Layer};

#[derive(Clone, Debug, PartialEq, Eq, Args)]
pub struct Options {
    /// Start a tokio-console server on `http://127.0.0.1:6669/`. Requires a
    /// build with the `tokio-console` feature and
    /// `RUSTFLAGS="--cfg tokio_unstable"`.
    #[arg(long)]
    pub tokio_console: bool,
}

impl Options {
    pub fn to_layer<S>(&self) -> AnyhowResult<impl Layer<S>>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
    {
        #[cfg(feature = "tokio-console")]
        {
            Ok(self.tokio_console.then(|| {
                assert!(
                    cfg!(tokio_unstable),
                    "enabling --tokio-console requires a build with RUSTFLAGS=\"--cfg tokio_unstable\""
                );
                info!("tokio-console available at http://127.0.0.1:6669/");
                console_subscriber::ConsoleLayer::builder().spawn()
            }))
        }

        #[cfg(not(feature = "tokio-console"))]
        {
            if self.tokio_console {
                anyhow::bail!("--tokio-console requires a build with the `tokio-console` feature enabled");
            }
            Ok(None::<Box<dyn Layer<S> + Send + Sync>>)
        }
    }
}
