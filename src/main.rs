use std::sync::Arc;

use crawlspace::cli::{Cli, Commands};
use crawlspace::config::CrawlerConfig;
use crawlspace::dispatcher::Dispatcher;
use crawlspace::fetcher::FetchManager;
use crawlspace::handler::LoggingHandler;
use crawlspace::sled_store::SledStore;
use crawlspace::store::{DispatchStore, LinkStore};
use crawlspace::url::CrawlUrl;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    crawlspace::logging::init();

    let cli = Cli::parse_args();
    let config = CrawlerConfig::load_or_default(&cli.config)?;
    let store = Arc::new(SledStore::open(&cli.data_dir, &config)?);

    match cli.command {
        Commands::Crawl { no_dispatcher } => {
            let dispatcher = (!no_dispatcher).then(|| {
                Dispatcher::new(
                    store.clone() as Arc<dyn DispatchStore>,
                    config.dispatcher.clone(),
                )
            });

            let manager = FetchManager::new(config, store.clone(), Arc::new(LoggingHandler))?;
            manager.start().await?;
            if let Some(dispatcher) = &dispatcher {
                dispatcher.start();
            }

            tracing::info!("crawling; press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");

            if let Some(dispatcher) = &dispatcher {
                dispatcher.stop().await;
            }
            manager.stop().await;
        }

        Commands::Dispatch { once } => {
            let dispatcher = Dispatcher::new(
                store.clone() as Arc<dyn DispatchStore>,
                config.dispatcher.clone(),
            );
            if once {
                let count = dispatcher.cycle().await?;
                println!("dispatched {count} domain(s)");
            } else {
                dispatcher.start();
                tracing::info!("dispatching; press ctrl-c to stop");
                tokio::signal::ctrl_c().await?;
                dispatcher.stop().await;
            }
        }

        Commands::Seed { url, getnow } => {
            let parsed = CrawlUrl::parse(&url)?;
            if !config.accepts_scheme(parsed.scheme()) {
                return Err(format!(
                    "scheme {:?} is not in accept_protocols {:?}",
                    parsed.scheme(),
                    config.accept_protocols
                )
                .into());
            }
            store.insert_link(&parsed, getnow).await?;
            println!("seeded {parsed} into domain {}", parsed.tld_plus_one());
        }

        Commands::Unclaim => {
            store.unclaim_all().await?;
            println!("cleared all claim tokens");
        }
    }

    Ok(())
}
