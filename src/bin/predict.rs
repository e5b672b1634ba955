//! 画像ファイルを逆立ち判定するバイナリ
//!
//! ```text
//! predict models/final_handstand_detector_07.mpk a.jpg b.avif --csv result.csv
//! ```
//!
//! `.avif` の入力は `avif` フィーチャー付きでビルドしたときのみ読めます。

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use handstand_detector::model::select_device;
use handstand_detector::{AppConfig, DefaultBackend, InferenceEngine};
use serde::Serialize;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "predict", about = "Classify images as handstand / not handstand")]
struct Args {
    /// 学習済み重みファイル（.mpk）
    weights: PathBuf,

    /// 判定する画像
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// 結果をCSVに書き出す
    #[arg(long)]
    csv: Option<PathBuf>,

    /// 失敗した画像をスキップして続行する
    #[arg(long)]
    keep_going: bool,
}

#[derive(Serialize)]
struct Row {
    path: String,
    is_handstand: bool,
    probability: f32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = AppConfig::load_or_default();
    let device = select_device(config.device_type);

    let engine = InferenceEngine::<DefaultBackend>::load(&args.weights, device)
        .with_context(|| format!("モデルの読み込みに失敗しました: {}", args.weights.display()))?;
    println!("モデル: {} ({})", args.weights.display(), engine.architecture());

    let mut rows = Vec::new();
    for path in &args.images {
        let prediction = match engine.classify_image(path) {
            Ok(p) => p,
            Err(e) if args.keep_going => {
                warn!("{} をスキップします: {}", path.display(), e);
                continue;
            }
            Err(e) => return Err(e).with_context(|| format!("判定に失敗しました: {}", path.display())),
        };
        println!(
            "{}: is_handstand={} probability={:.4}",
            path.display(),
            prediction.is_handstand,
            prediction.probability
        );
        rows.push(Row {
            path: path.to_string_lossy().into_owned(),
            is_handstand: prediction.is_handstand,
            probability: prediction.probability,
        });
    }

    if let Some(csv_path) = &args.csv {
        let mut writer = csv::Writer::from_path(csv_path)
            .with_context(|| format!("CSVを作成できません: {}", csv_path.display()))?;
        for row in &rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        println!("結果を保存しました: {}", csv_path.display());
    }

    Ok(())
}
