//! # squadsim
//!
//! 敵AI分隊の意思決定・戦闘位置取りエンジンと、それをYAMLシナリオで動かす
//! 固定時間刻みシミュレーター。
//!
//! - [`models`] 知覚・カバー・武器・分隊・状態機械などのAIコア
//! - [`scenario`] シナリオ設定の読み込みと検証
//! - [`simulation`] シミュレーションエンジン
//! - [`logging`] tracingによるログ出力設定

pub mod logging;
pub mod models;
pub mod scenario;
pub mod simulation;
