#![deny(warnings)]
use clap::{App, Arg};
use infer_serve::exit_code;
use std::collections::HashMap;
use std::time::Duration;
use supervisor::{
    config::LaunchConfiguration, Builder, EngineCommand, Endpoints, Error, RestartPolicy,
};

#[tokio::main]
async fn main() {
    let matches = App::new("Inference Service Supervisor")
        .about("Launches a GPU-backed inference engine and keeps it running")
        .arg(
            Arg::with_name("service_port")
                .long("service-port")
                .help("Primary inference/API port the engine must own")
                .default_value("7860")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("management_port")
                .long("management-port")
                .help("Secondary management/metrics port the engine must own")
                .default_value("2242")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("retry_limit")
                .long("retry-limit")
                .help("Consecutive engine failures tolerated before giving up")
                .default_value("5")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("restart_delay_ms")
                .long("restart-delay-ms")
                .help("Pause between an engine failure and the next launch attempt")
                .default_value("2000")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("min_uptime_secs")
                .long("min-uptime-secs")
                .help("Engine uptime after which the failure counter resets")
                .default_value("30")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("grace_period_secs")
                .long("grace-period-secs")
                .help("How long shutdown waits for the engine before killing it")
                .default_value("10")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("cache_dir")
                .long("cache-dir")
                .help("Host-mounted model weight cache shared with the engine")
                .default_value("/root/.cache/huggingface")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("engine_cmd")
                .long("engine-cmd")
                .help("Engine command line; configuration-derived arguments are appended")
                .default_value("python3 -m aphrodite.endpoints.openai.api_server")
                .takes_value(true),
        )
        .get_matches();

    let mut builder = env_logger::Builder::from_default_env();
    builder.format_timestamp_micros().init();

    // Launch parameters come from named environment variables; the resolver
    // gets an explicit snapshot so it never touches global state itself.
    let env: HashMap<String, String> = std::env::vars().collect();
    let config = match LaunchConfiguration::resolve(&env) {
        Ok(config) => config,
        Err(errors) => {
            for e in &errors {
                log::error!("{}", e);
            }
            std::process::exit(2);
        }
    };

    let command = {
        let raw = matches.value_of("engine_cmd").unwrap();
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts.next().expect("engine command must not be empty");
        EngineCommand {
            program,
            args: parts.collect(),
        }
    };
    let endpoints = Endpoints {
        service_port: matches.value_of("service_port").unwrap().parse().unwrap(),
        management_port: matches
            .value_of("management_port")
            .unwrap()
            .parse()
            .unwrap(),
    };
    let policy = RestartPolicy {
        retry_limit: matches.value_of("retry_limit").unwrap().parse().unwrap(),
        restart_delay: Duration::from_millis(
            matches.value_of("restart_delay_ms").unwrap().parse().unwrap(),
        ),
        min_uptime: Duration::from_secs(
            matches.value_of("min_uptime_secs").unwrap().parse().unwrap(),
        ),
        grace_period: Duration::from_secs(
            matches.value_of("grace_period_secs").unwrap().parse().unwrap(),
        ),
    };

    log::info!(
        "supervising model {} ({} GPUs, quantization {}, kv cache {})",
        config.model_name,
        config.gpu_count,
        config.quantization,
        config.kv_cache
    );

    let (mut supervisor, shutdown) = Builder::new()
        .configuration(config)
        .command(command)
        .endpoints(endpoints)
        .policy(policy)
        .cache_dir(matches.value_of("cache_dir").unwrap().into())
        .build();

    tokio::spawn(async move {
        wait_for_signal().await;
        log::info!("shutdown signal received");
        shutdown.shutdown();
    });

    if let Err(e) = supervisor.run().await {
        log::error!("{}", e);
        if let Error::RetryBudgetExhausted { log_tail, .. } = &e {
            for line in log_tail {
                log::error!("engine: {}", line);
            }
        }
        std::process::exit(exit_code(&e));
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).unwrap();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
