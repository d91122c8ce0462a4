use std::{fs, process::exit};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use foxline::config::Config;
use foxline::paging::{
    ConversationLoader, ConversationResult, ConversationService, LoadState, Pager, TimelineMediator,
};
use foxline::sources::{twitter::TwitterClient, Post};
use foxline::{AccountKey, TimelineCache, TimelineKey, TimelineKind};

#[derive(Parser)]
#[clap(version, about)]
struct Args {
    /// Toml configuration. See README for more info.
    #[clap(short, long, value_parser, default_value = "foxline.toml")]
    config: String,

    /// Cache database. Can be redefined in config.
    #[clap(short = 's', long, value_parser, default_value = "foxline.db")]
    cache: String,

    /// Ignores config cache file and use by command line arguments.
    #[clap(long, value_parser, default_value_t = false)]
    ignore_config_cache_file: bool,

    /// Debug logging
    #[clap(short, long, value_parser, default_value_t = false)]
    verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reload a timeline from the newest post: home, mentions, user:<id>, search:<query>
    Refresh {
        #[clap(value_parser)]
        timeline: String,
    },
    /// Load the next older page of a timeline
    More {
        #[clap(value_parser)]
        timeline: String,
    },
    /// Print cached posts of a timeline
    Show {
        #[clap(value_parser)]
        timeline: String,
        #[clap(short, long, value_parser, default_value_t = 20)]
        limit: usize,
    },
    /// Load and print the thread around a post
    Thread {
        #[clap(value_parser)]
        status_id: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("foxline=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("foxline=info,warn"))
    };
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::debug!(config = %args.config, "Reading config");
    let bytes = fs::read(&args.config).with_context(|| format!("Failed to open {}", args.config))?;
    let cfg = Config::from_toml(&String::from_utf8_lossy(&bytes)).context("Invalid config")?;

    let cache_filename = if args.ignore_config_cache_file {
        args.cache
    } else {
        cfg.cache.clone().unwrap_or(args.cache)
    };

    let cache = TimelineCache::open(&cache_filename)
        .with_context(|| format!("Failed to open cache {cache_filename}"))?;
    let tw = TwitterClient::with_api_base(cfg.twitter.token.clone(), cfg.twitter.api_base.clone());
    let account = AccountKey(cfg.twitter.account_id.clone());

    let failed = match args.command {
        Command::Refresh { timeline } => {
            let mut pager = pager(&cfg, &tw, &cache, &account, &timeline)?;
            pager.refresh().await?;
            report(&pager, &pager.load_states().refresh).await?
        }
        Command::More { timeline } => {
            let mut pager = pager(&cfg, &tw, &cache, &account, &timeline)?;
            pager.append().await?;
            report(&pager, &pager.load_states().append).await?
        }
        Command::Show { timeline, limit } => {
            let kind: TimelineKind = timeline.parse()?;
            let posts = cache.list(&TimelineKey::new(account, kind)).await?;
            for cached in posts.iter().take(limit) {
                print_post(&cached.post, "");
            }
            false
        }
        Command::Thread { status_id } => {
            let root = match cache.find(&account, &status_id).await? {
                Some(post) => post,
                None => tw.lookup(&status_id).await?,
            };
            let loader = ConversationLoader::new(tw, cache, account);

            for post in loader.load_previous(&root).await? {
                print_post(&post, "  ");
            }
            print_post(&root, "> ");
            match loader.load_conversation(&root, None).await? {
                ConversationResult::Loaded(replies) => {
                    for post in &replies.posts {
                        print_post(post, "  ");
                    }
                    false
                }
                ConversationResult::Error(e) => {
                    eprintln!("[FAILURE] Failed to load replies: {e}");
                    true
                }
            }
        }
    };

    if failed {
        exit(2);
    }
    Ok(())
}

fn pager(cfg: &Config, tw: &TwitterClient, cache: &TimelineCache, account: &AccountKey, timeline: &str) -> Result<Pager> {
    let kind: TimelineKind = timeline.parse()?;
    let fetch = tw
        .fetcher(&kind, &account.0)
        .ok_or_else(|| anyhow!("timeline {kind} can not be paged"))?;
    let page_size = TwitterClient::effective_page_size(&kind, cfg.page_size);
    let mediator = TimelineMediator::new(TimelineKey::new(account.clone(), kind), cache.clone(), fetch);
    Ok(Pager::new(mediator, page_size))
}

/// Print the outcome of a load. Returns `true` if it failed.
async fn report(pager: &Pager, state: &LoadState) -> Result<bool> {
    let cached = pager.item_count().await?;
    match state {
        LoadState::NotLoading { end_of_pagination_reached } => {
            println!("{}: {cached} cached, end reached: {end_of_pagination_reached}", pager.mediator().key());
            Ok(false)
        }
        LoadState::Error(e) => {
            eprintln!("[FAILURE] Failed to load {}. {e}", pager.mediator().key());
            Ok(true)
        }
        LoadState::Loading => Ok(false),
    }
}

fn print_post(post: &Post, prefix: &str) {
    println!("{prefix}[{}] @{}: {}", post.id, post.author.handle, post.text.replace('\n', " "));
}
