use clap::{Arg, Command};
use tracing::{error, info};

use squadsim::logging::{LogConfig, LogOutput, init_logging, parse_log_level};
use squadsim::scenario::ScenarioConfig;
use squadsim::simulation::SimulationEngine;

fn main() {
    // コマンドライン引数の解析
    let matches = Command::new("squadsim")
        .version("0.1.0")
        .about("敵AI分隊シミュレーション (Squad AI Simulation)")
        .long_about("敵AI分隊の意思決定と戦闘位置取りを再現するシミュレーター\n\
                     固定時間刻みでシナリオを実行し、知覚・遮蔽・射撃・分隊連携を評価します。")
        .arg(
            Arg::new("scenario")
                .short('s')
                .long("scenario")
                .value_name("FILE")
                .help("シナリオファイル(.yaml)のパスを指定")
                .long_help("実行するシナリオファイル(.yaml)のパスを指定します。\n\
                           指定しない場合、利用可能なシナリオ一覧を表示します。")
        )
        .arg(
            Arg::new("info")
                .short('i')
                .long("info")
                .action(clap::ArgAction::SetTrue)
                .help("シナリオの情報のみ表示して終了")
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::Count)
                .help("詳細出力レベル (-v: 基本, -vv: 詳細, -vvv: トレース)")
        )
        .arg(
            Arg::new("log-output")
                .long("log-output")
                .value_name("TARGET")
                .default_value("console")
                .help("ログ出力先 (console, file, both)")
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("ログレベル (trace, debug, info, warn, error)。未指定時は -v から決定")
        )
        .arg(
            Arg::new("log-dir")
                .long("log-dir")
                .value_name("DIR")
                .default_value("logs")
                .help("ログファイルの出力ディレクトリ")
        )
        .get_matches();

    let verbose_level = matches.get_count("verbose");

    // ログ設定（不正な指定は警告して既定値で続行）
    let mut log_config = LogConfig::from_verbosity(verbose_level);
    if let Some(output) = matches.get_one::<String>("log-output") {
        match output.parse::<LogOutput>() {
            Ok(output) => log_config.output = output,
            Err(e) => eprintln!("警告: {}", e),
        }
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        match parse_log_level(level) {
            Ok(level) => log_config.level = level,
            Err(e) => eprintln!("警告: {}", e),
        }
    }
    if let Some(dir) = matches.get_one::<String>("log-dir") {
        log_config.log_dir = dir.clone();
    }
    let log_guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("ログ初期化に失敗しました: {}", e);
            None
        }
    };

    println!("敵AI分隊シミュレーション (Squad AI Simulation) - squadsim v0.1.0");
    println!();

    if verbose_level > 0 {
        println!("詳細出力レベル: {}", verbose_level);
    }

    // シナリオファイルの処理
    if let Some(scenario_path) = matches.get_one::<String>("scenario") {
        match run_scenario(scenario_path, matches.get_flag("info"), verbose_level) {
            Ok(_) => {
                if verbose_level > 0 {
                    println!("シナリオ実行が正常に完了しました。");
                }
            }
            Err(e) => {
                error!(error = %e, "SCENARIO_FAILED: シナリオ実行に失敗しました");
                eprintln!("エラー: {}", e);
                // exitはデストラクタを呼ばないので先にファイル出力を書き出す
                drop(log_guard);
                std::process::exit(1);
            }
        }
    } else {
        // デフォルト動作: 利用可能なシナリオ一覧を表示
        show_default_help();
    }
}

/// シナリオファイルを読み込んで実行
fn run_scenario(scenario_path: &str, info_only: bool, verbose_level: u8) -> Result<(), Box<dyn std::error::Error>> {
    let scenario = ScenarioConfig::from_file(scenario_path)?;
    info!(path = scenario_path, name = %scenario.meta.name, "SCENARIO_LOADED: シナリオを読み込みました");

    if info_only {
        scenario.print_summary();
        return Ok(());
    }

    execute_scenario(scenario, verbose_level)
}

/// シナリオの実行
fn execute_scenario(scenario: ScenarioConfig, verbose_level: u8) -> Result<(), Box<dyn std::error::Error>> {
    scenario.print_summary();
    println!();

    if verbose_level > 0 {
        println!("シミュレーション設定:");
        println!("  時間刻み: {:.3}秒", scenario.sim.dt_s);
        println!("  最大時間: {:.1}秒", scenario.sim.t_max_s);
        println!("  シード値: {}", scenario.sim.seed);
        println!();
    }

    let mut simulation = SimulationEngine::new(scenario, verbose_level);
    simulation.initialize()?;

    let stats = simulation.run()?;
    stats.print_summary();

    Ok(())
}

/// デフォルトヘルプとシナリオ一覧を表示
fn show_default_help() {
    println!("使用方法:");
    println!("  squadsim [オプション]");
    println!();
    println!("オプション:");
    println!("  -s, --scenario <FILE>    シナリオファイルを指定して実行");
    println!("  -i, --info               シナリオ情報のみ表示");
    println!("  -v, --verbose            詳細出力 (複数指定で詳細レベル上昇)");
    println!("      --log-output <TARGET> ログ出力先 (console, file, both)");
    println!("      --log-level <LEVEL>  ログレベル");
    println!("      --log-dir <DIR>      ログファイルの出力ディレクトリ");
    println!("  -h, --help               このヘルプを表示");
    println!();
    println!("利用可能なシナリオファイル:");
    println!("  scenarios/ambush.yaml    - 二分隊による待ち伏せ（遮蔽物・反撃あり）");
    println!("  scenarios/patrol.yaml    - 単一分隊の巡回と隊形維持");
    println!();
    println!("例:");
    println!("  squadsim -s scenarios/ambush.yaml");
    println!("  squadsim -s scenarios/ambush.yaml -vv --log-output both");
    println!("  squadsim -s scenarios/patrol.yaml -i");
}
