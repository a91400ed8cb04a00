use anyhow::Context;
use clap::Parser;
use lingxun::config::cli::{CliArgs, Command, FormArgs};
use lingxun::core::ConfigProvider;
use lingxun::domain::region::RegionOption;
use lingxun::utils::error::ErrorSeverity;
use lingxun::utils::{logger, validation::Validate};
use lingxun::{
    AnalysisController, BirthForm, FileStore, HistoryCache, HttpTransport, LingxunError,
    RegionCascade, RegionTable, SessionSnapshot, SubmitOutcome, TomlConfig,
};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::watch;

type Controller = AnalysisController<HttpTransport, FileStore>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let config = args
        .load_config()
        .inspect_err(|e| eprintln!("💡 {}", e.recovery_suggestion()))
        .context("Failed to load configuration")?;

    // 初始化日誌
    if config.logging.json {
        logger::init_json_logger(config.logging.verbose);
    } else {
        logger::init_cli_logger(config.logging.verbose);
    }
    tracing::debug!("Config: {:?}", config);

    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        eprintln!("❌ {}", e.user_friendly_message());
        eprintln!("💡 {}", e.recovery_suggestion());
        std::process::exit(1);
    }

    if let Err(e) = run(args.command, &config).await {
        tracing::error!(
            "❌ {} (Category: {:?}, Severity: {:?})",
            e,
            e.category(),
            e.severity()
        );
        eprintln!("❌ {}", e.user_friendly_message());
        eprintln!("💡 建議: {}", e.recovery_suggestion());

        let exit_code = match e.severity() {
            ErrorSeverity::Low => 2,
            ErrorSeverity::Medium => 3,
            ErrorSeverity::High => 1,
            ErrorSeverity::Critical => 4,
        };
        std::process::exit(exit_code);
    }

    Ok(())
}

fn load_regions(config: &TomlConfig) -> lingxun::Result<Arc<RegionTable>> {
    let table = match config.region_dataset() {
        Some(path) => {
            tracing::info!("📁 Loading region dataset from {}", path);
            RegionTable::from_file(path)?
        }
        None => RegionTable::bundled()?,
    };
    Ok(Arc::new(table))
}

async fn build_controller(config: &TomlConfig) -> Controller {
    let history = HistoryCache::load(FileStore::new(config.store_path())).await;
    AnalysisController::new(HttpTransport::new(config.api_endpoint()), history)
}

async fn run(command: Command, config: &TomlConfig) -> lingxun::Result<()> {
    let regions = load_regions(config)?;

    match command {
        Command::Analyze(form_args) => {
            let controller = build_controller(config).await;
            analyze(&controller, &form_args, regions).await
        }
        Command::History => {
            let entries = build_controller(config).await.history().await;
            if entries.is_empty() {
                println!("暫無歷史記錄");
            }
            for (i, entry) in entries.iter().enumerate() {
                println!("[{}] {} {} {}", i, entry.name, entry.gender, entry.birth_location);
            }
            Ok(())
        }
        Command::Replay { index } => {
            let controller = build_controller(config).await;
            let entry = controller.history_entry(index).await.ok_or_else(|| {
                LingxunError::InvalidConfigValueError {
                    field: "index".to_string(),
                    value: index.to_string(),
                    reason: "no history entry at this position".to_string(),
                }
            })?;

            let mut form = BirthForm::default();
            form.fill_from_history(&entry)?;

            let mut cascade = RegionCascade::new(regions);
            if let Some(province) = &entry.province_code {
                cascade.restore_with(
                    province,
                    entry.city_code.as_deref(),
                    entry.area_code.as_deref(),
                    |phase, state| {
                        tracing::debug!("Restored {:?}: {:?}", phase, state.location_label())
                    },
                );
            }

            tracing::info!("🔁 Replaying history entry {} ({})", index, entry.name);
            stream_to_stdout(&controller, &form, &cascade).await
        }
        Command::Regions { province, city } => {
            print_regions(RegionCascade::new(regions), province.as_deref(), city.as_deref());
            Ok(())
        }
    }
}

async fn analyze(
    controller: &Controller,
    form_args: &FormArgs,
    regions: Arc<RegionTable>,
) -> lingxun::Result<()> {
    let form = form_args.to_form();
    let mut cascade = RegionCascade::new(regions);
    form_args.apply_region(&mut cascade);
    stream_to_stdout(controller, &form, &cascade).await
}

/// 邊收邊印；只印出尚未輸出過的部分
async fn stream_to_stdout(
    controller: &Controller,
    form: &BirthForm,
    cascade: &RegionCascade,
) -> lingxun::Result<()> {
    let updates = controller.subscribe();
    let (outcome, _) = tokio::join!(
        controller.submit(form, cascade),
        print_updates(updates, std::io::stdout())
    );

    match outcome? {
        SubmitOutcome::Completed(_) => {
            println!();
            tracing::info!("✅ 分析已完成");
        }
        SubmitOutcome::Superseded => tracing::warn!("Analysis was superseded"),
    }
    Ok(())
}

/// 輸出失敗 (例如管線已關閉) 時停止列印，分析本身繼續完成
async fn print_updates<W: Write>(
    mut updates: watch::Receiver<SessionSnapshot>,
    mut out: W,
) -> std::io::Result<()> {
    let mut printed = 0usize;
    let mut waiting_shown = false;

    while updates.changed().await.is_ok() {
        let snapshot = updates.borrow_and_update().clone();

        if snapshot.loading && !waiting_shown {
            tracing::info!("⏳ 正在请求AI大师分析中...");
            waiting_shown = true;
        }
        if snapshot.result_text.len() > printed {
            let written = out
                .write_all(snapshot.result_text[printed..].as_bytes())
                .and_then(|_| out.flush());
            if let Err(e) = written {
                tracing::warn!("Stopped printing analysis output: {}", e);
                return Err(e);
            }
            printed = snapshot.result_text.len();
        }
        if snapshot.status.is_terminal() {
            break;
        }
    }
    Ok(())
}

fn print_regions(mut cascade: RegionCascade, province: Option<&str>, city: Option<&str>) {
    let options: Vec<RegionOption> = match (province, city) {
        (Some(province), Some(city)) => {
            cascade.select_province(province);
            cascade.select_city(city);
            cascade.areas()
        }
        (Some(province), None) => {
            cascade.select_province(province);
            cascade.cities()
        }
        _ => cascade.provinces(),
    };

    for option in options {
        println!("{}\t{}", option.code, option.label);
    }
}
