use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use verifdoc_core::config::Config;
use verifdoc_core::dispatch::ModelDispatcher;
use verifdoc_core::ledger::IntegrityLedger;
use verifdoc_core::record::{AnalysisRecord, ReportSeal};
use verifdoc_core::registry::ModelRegistry;
use verifdoc_core::report::ReportGenerator;
use verifdoc_core::signer::ReportSigner;
use verifdoc_core::tensor::PostprocessOverrides;
use verifdoc_core::{AnalysisRequest, ErrorPayload, ForensicError, ForensicPipeline};

#[derive(Parser, Debug)]
#[command(name = "verifdoc")]
#[command(about = "Document forgery analysis: detectors, score fusion and sealed reports")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 对一张文档图像运行全部检测器并输出分析记录
    Analyze {
        image: PathBuf,

        /// 原始文件名 (决定是否执行 PDF 专项检查)，默认取图像路径的文件名
        #[arg(long)]
        filename: Option<String>,

        /// 要求执行文档专项检查
        #[arg(long)]
        document_checks: bool,

        /// 生成报告并签名入账
        #[arg(long)]
        report: bool,

        /// 记录标识，默认使用图像指纹前缀
        #[arg(long)]
        record_id: Option<String>,
    },
    /// 用单个模型执行推理
    Infer {
        model: String,
        image: PathBuf,

        /// 稠密图二值化阈值
        #[arg(long)]
        threshold: Option<f32>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // 日志写到 stderr，stdout 只留给 JSON 结果
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "verifdoc=info,verifdoc_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let payload = match err.downcast_ref::<ForensicError>() {
                Some(e) => e.to_payload(),
                None => ErrorPayload {
                    kind: "internal",
                    message: format!("{err:#}"),
                },
            };
            tracing::error!(kind = payload.kind, "❌ {}", payload.message);
            println!("{}", json!({ "error": payload }));
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    // ----------------------------------------------------------------
    // 0. 加载配置 & 模型注册表
    // ----------------------------------------------------------------
    let config = Config::from_env()?;
    tracing::info!(
        project = %config.project_name,
        registry = %config.registry_path.display(),
        timeout_ms = config.detector_timeout.as_millis() as u64,
        "⚙️ 配置加载完成"
    );
    let registry = ModelRegistry::load(&config.registry_path, &config.model_dir)?;
    let dispatcher = Arc::new(ModelDispatcher::with_default_loaders(registry));

    match command {
        Command::Analyze {
            image,
            filename,
            document_checks,
            report,
            record_id,
        } => {
            let bytes = tokio::fs::read(&image).await?;
            let filename = filename.or_else(|| {
                image
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            });

            // ----------------------------------------------------------------
            // 1. 分析
            // ----------------------------------------------------------------
            let pipeline = ForensicPipeline::from_config(&config, dispatcher);
            let outcome = pipeline
                .analyze(AnalysisRequest {
                    image: bytes,
                    filename: filename.clone(),
                    require_document_checks: document_checks,
                })
                .await?;

            let id = record_id.unwrap_or_else(|| outcome.fingerprint.short_id().to_string());
            let record = AnalysisRecord::new(id, filename.unwrap_or_default(), outcome);

            if !report {
                println!("{}", serde_json::to_string_pretty(&record)?);
                return Ok(());
            }

            // ----------------------------------------------------------------
            // 2. 报告 (阻塞 I/O，放到阻塞线程池)
            // ----------------------------------------------------------------
            let generator = ReportGenerator::new(&config.report_dir, &config.heatmap_dir, &config.project_name);
            let (record, artifact) = tokio::task::spawn_blocking(move || {
                let artifact = generator.generate(&record, &record.heatmaps);
                (record, artifact)
            })
            .await?;
            let artifact = artifact?;

            // ----------------------------------------------------------------
            // 3. 封条：签名 + 入账
            // ----------------------------------------------------------------
            let seal = ReportSeal {
                record_id: record.id.clone(),
                filename: record.filename.clone(),
                report_sha256: artifact.sha256.clone(),
                sealed_at: chrono::Utc::now().timestamp(),
            };
            let signer = ReportSigner::load_or_generate(&config.key_path)?;
            let signature = signer.sign(&seal)?;

            // 账本跨进程累积：每次运行都接在上一次的 Root 之后
            let mut ledger = IntegrityLedger::open(&config.ledger_path)?;
            let (root, pos) = ledger.append(&seal)?;

            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "record": record,
                    "report": {
                        "location": artifact.location.display().to_string(),
                        "sha256": artifact.sha256,
                    },
                    "seal": seal,
                    "signature": hex::encode(signature.to_bytes()),
                    "public_key": hex::encode(signer.public_key().to_bytes()),
                    "ledger": {
                        "root": hex::encode(root),
                        "pos": pos,
                        "leaves": ledger.len(),
                        "path": config.ledger_path.display().to_string(),
                    },
                }))?
            );
        }
        Command::Infer { model, image, threshold } => {
            let bytes = tokio::fs::read(&image).await?;
            let post = PostprocessOverrides { threshold };
            let output = tokio::task::spawn_blocking(move || {
                dispatcher.run_inference(&model, &bytes, None, Some(&post))
            })
            .await??;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
