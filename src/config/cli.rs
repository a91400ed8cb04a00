use crate::config::toml_config::TomlConfig;
use crate::domain::model::{BirthForm, CalendarMode, Gender, LunarDate};
use crate::domain::region::RegionCascade;
use crate::utils::error::Result;
use chrono::{NaiveDate, NaiveTime};
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Clone, Parser)]
#[command(name = "lingxun")]
#[command(about = "Streaming client for the birth-profile analysis backend")]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<String>,

    /// Override the analysis endpoint
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Override the history store directory
    #[arg(long)]
    pub store: Option<String>,

    /// Region dataset JSON file
    #[arg(long)]
    pub regions: Option<String>,

    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, help = "Emit logs as JSON")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Submit a birth profile and stream the analysis
    Analyze(FormArgs),
    /// List the most recent submissions
    History,
    /// Re-submit a history entry (0 = newest)
    Replay { index: usize },
    /// List region options for the cascade
    Regions {
        #[arg(long)]
        province: Option<String>,
        #[arg(long)]
        city: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Args)]
pub struct FormArgs {
    #[arg(long, default_value = "")]
    pub name: String,

    /// male/female (男/女)
    #[arg(long)]
    pub gender: Option<Gender>,

    /// Solar birth date, YYYY-MM-DD
    #[arg(long)]
    pub date: Option<NaiveDate>,

    /// Use the lunar calendar fields (--year/--month/--day)
    #[arg(long)]
    pub lunar: bool,

    #[arg(long)]
    pub year: Option<i32>,

    #[arg(long)]
    pub month: Option<u32>,

    #[arg(long)]
    pub day: Option<u32>,

    /// Birth time, HH:MM:SS
    #[arg(long)]
    pub time: Option<NaiveTime>,

    #[arg(long)]
    pub province: Option<String>,

    #[arg(long)]
    pub city: Option<String>,

    #[arg(long)]
    pub area: Option<String>,
}

impl FormArgs {
    pub fn to_form(&self) -> BirthForm {
        BirthForm {
            name: self.name.clone(),
            gender: self.gender,
            calendar: if self.lunar {
                CalendarMode::Lunar
            } else {
                CalendarMode::Solar
            },
            solar_date: self.date,
            lunar: LunarDate {
                year: self.year,
                month: self.month,
                day: self.day,
            },
            time: self.time,
        }
    }

    /// 依序選擇省、市、區，與介面上的操作順序相同
    pub fn apply_region(&self, cascade: &mut RegionCascade) {
        if let Some(province) = &self.province {
            cascade.restore(province, self.city.as_deref(), self.area.as_deref());
        }
    }
}

impl CliArgs {
    /// 先讀設定檔，再套用命令列覆蓋
    pub fn load_config(&self) -> Result<TomlConfig> {
        let mut config = match &self.config {
            Some(path) => TomlConfig::from_file(path)?,
            None => TomlConfig::default(),
        };

        if let Some(endpoint) = &self.endpoint {
            config.backend.endpoint = endpoint.clone();
        }
        if let Some(store) = &self.store {
            config.storage.path = store.clone();
        }
        if let Some(regions) = &self.regions {
            config.regions.dataset = Some(regions.clone());
        }
        config.logging.verbose |= self.verbose;
        config.logging.json |= self.json_logs;

        Ok(config)
    }
}
