mod cli;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use alarm_mailer::config::{AppConfig, DestinationConfig, MailConfig, MainConfig};
use alarm_mailer::logging::init_logging;
use alarm_mailer::monitor::{FeedMonitor, RawUpdate, Severity, SourceClassifier};
use alarm_mailer::notification::render::{BUILTIN_HTML, BUILTIN_PLAIN};
use alarm_mailer::notification::{
    AlarmEvent, BatchItem, BatchQueueConfig, RenderContext, Renderer, SmtpTransport, SourceMeta,
    TemplateRenderer,
};
use alarm_mailer::services::AlarmMailer;
use anyhow::Context;
use clap::Parser;
use tokio::io::BufReader;
use tracing::{error, info};

use crate::cli::{Cli, Commands, ExpandArgs, RunArgs, TestMailArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log.as_deref())?;

    match cli.command.clone() {
        None => run(&cli, cli.run.clone()).await,
        Some(Commands::Run(args)) => run(&cli, args).await,
        Some(Commands::TestMail(args)) => test_mail(&cli, args).await,
        Some(Commands::Expand(args)) => expand(&cli, args),
    }
}

async fn run(cli: &Cli, args: RunArgs) -> anyhow::Result<()> {
    let mut config = AppConfig::load(&cli.config)
        .with_context(|| format!("invalid configuration {}", cli.config.display()))?;
    if args.nosend {
        config.mail.nosend = true;
    }

    let monitor = Arc::new(FeedMonitor::new());
    let renderer = Arc::new(TemplateRenderer::from_search_path(&cli.template));
    let transport = Arc::new(SmtpTransport::from_config(&config.mail));
    let mut mailer = AlarmMailer::start(config, monitor.clone(), renderer, transport)?;

    let feed_monitor = Arc::clone(&monitor);
    let updates = args.updates.clone();
    let mut feed = tokio::spawn(async move {
        match updates {
            Some(path) => {
                info!("Reading updates from {}", path.display());
                let file = tokio::fs::File::open(&path).await?;
                feed_monitor.run_reader(BufReader::new(file)).await
            }
            None => {
                info!("Reading updates from stdin");
                feed_monitor
                    .run_reader(BufReader::new(tokio::io::stdin()))
                    .await
            }
        }
    });

    let result = {
        let stop = async {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal.context("failed to listen for Ctrl-C")?;
                    info!("Interrupted");
                }
                done = &mut feed => match done {
                    Ok(Ok(count)) => info!("Update feed closed after {} updates", count),
                    Ok(Err(e)) => error!("Update feed failed: {}", e),
                    Err(e) => error!("Update feed task failed: {}", e),
                },
            }
            Ok::<(), anyhow::Error>(())
        };
        tokio::pin!(stop);

        tokio::select! {
            res = &mut stop => res,
            _ = mailer.report_unconnected_after_initial_wait() => (&mut stop).await,
        }
    };

    feed.abort();
    mailer.shutdown().await;
    result
}

async fn test_mail(cli: &Cli, args: TestMailArgs) -> anyhow::Result<()> {
    let mut mail = if cli.config.exists() {
        MailConfig::load(&cli.config)?
    } else {
        info!("No configuration at {}, using mail defaults", cli.config.display());
        MailConfig::default()
    };
    if args.nosend {
        mail.nosend = true;
    }

    let mut dest = DestinationConfig::new("test", vec![args.to.clone()], vec!["test".to_string()]);
    dest.from = args.from.clone();
    dest.plain = BUILTIN_PLAIN.to_string();
    dest.html = BUILTIN_HTML.to_string();
    dest.send_initial = true;
    dest.validate()?;
    dest.queue = BatchQueueConfig::new(Duration::from_secs(1), Duration::from_secs(2), 10);
    let delivery_wait = dest.queue.delay + mail.queue.delay + mail.timeout;

    let config = AppConfig {
        main: MainConfig {
            initial_wait: Duration::ZERO,
        },
        mail,
        groups: BTreeMap::new(),
        destinations: vec![Arc::new(dest)],
    };

    let transport = Arc::new(SmtpTransport::from_config(&config.mail));
    let mut mailer = AlarmMailer::start(
        config,
        Arc::new(FeedMonitor::new()),
        Arc::new(TemplateRenderer::new(Vec::new())),
        transport,
    )?;

    info!("Sending test mail to {}", args.to);
    tokio::select! {
        _ = tokio::time::sleep(delivery_wait) => {}
        signal = tokio::signal::ctrl_c() => signal.context("failed to listen for Ctrl-C")?,
    }
    mailer.shutdown().await;
    Ok(())
}

fn expand(cli: &Cli, args: ExpandArgs) -> anyhow::Result<()> {
    let dest = DestinationConfig::new(
        "sample",
        vec!["operators@localhost".to_string()],
        vec!["sample".to_string()],
    );
    let events = sample_events();
    let renderer = TemplateRenderer::from_search_path(&cli.template);
    let out = renderer.render(&args.template, &RenderContext::new(&events, &dest))?;
    println!("{}", out);
    Ok(())
}

/// A startup notice plus a scripted run of transitions on one source.
fn sample_events() -> Vec<AlarmEvent> {
    let meta = Arc::new(SourceMeta {
        group: "sample".to_string(),
        descriptions: [("SAMPLE:PRESSURE".to_string(), "Sample pressure gauge".to_string())]
            .into_iter()
            .collect(),
    });
    let mut classifier = SourceClassifier::new("SAMPLE:PRESSURE", meta, true);

    let updates = [
        RawUpdate::connected("SAMPLE:PRESSURE", Severity::NO_ALARM, "1.2e-9"),
        RawUpdate::connected("SAMPLE:PRESSURE", Severity::MINOR, "3.0e-7"),
        RawUpdate::connected("SAMPLE:PRESSURE", Severity::MAJOR, "5.1e-5").with_update_count(3),
        RawUpdate::connected("SAMPLE:PRESSURE", Severity::MINOR, "4.0e-7"),
        RawUpdate::connected("SAMPLE:PRESSURE", Severity::NO_ALARM, "1.1e-9"),
        RawUpdate::disconnected("SAMPLE:PRESSURE"),
    ];

    let mut events = vec![AlarmEvent::startup_notice()];
    for update in updates {
        events.extend(classifier.observe(update.with_units("Torr")));
    }
    events.sort_by_key(|e| std::cmp::Reverse(e.priority()));
    events
}
