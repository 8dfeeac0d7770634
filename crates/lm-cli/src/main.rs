//!
//! CLI для потоковой генерации текста (Qwen3, Llama).

use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use lm_core::{Fragment, GenerateOptions, SamplingParams};
use lm_engine::LmEngine;

/// Архитектура модели для CLI.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum ArchArg {
    /// Qwen3 (по умолчанию)
    Qwen3,
    /// Llama 2/3
    Llama,
}

impl ArchArg {
    fn to_arch_type(self) -> lm_core::ArchType {
        match self {
            ArchArg::Qwen3 => lm_core::ArchType::Qwen3,
            ArchArg::Llama => lm_core::ArchType::Llama,
        }
    }
}

#[derive(Parser)]
#[command(name = "rustlm")]
#[command(author, version, about = "RustLM: Streaming Text Generation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a streamed completion for a prompt
    Generate {
        /// Path to the model directory
        #[arg(long)]
        model: PathBuf,

        /// Архитектура: qwen3 (по умолчанию) или llama
        #[arg(long, value_enum, default_value = "qwen3")]
        arch: ArchArg,

        /// Текст запроса
        #[arg(long)]
        prompt: String,

        /// Device to use (cpu, metal, cuda)
        #[arg(long, default_value = "cpu")]
        device: String,

        /// Максимальное количество новых токенов
        #[arg(long, default_value_t = 512)]
        max_tokens: usize,

        /// Температура сэмплирования (0 = greedy)
        #[arg(long, default_value_t = 0.7)]
        temperature: f32,

        /// Top-k фильтр
        #[arg(long)]
        top_k: Option<usize>,

        /// Nucleus (top-p) фильтр
        #[arg(long)]
        top_p: Option<f32>,

        /// Seed генератора случайных чисел (по умолчанию — энтропия ОС)
        #[arg(long)]
        seed: Option<u64>,

        /// Минимальный интервал между обновлениями вывода, мс
        #[arg(long, default_value_t = 250)]
        flush_interval_ms: u64,

        /// Не оборачивать промпт в chat-шаблон архитектуры
        #[arg(long, default_value_t = false)]
        raw: bool,

        /// Загружать квантованные веса (GGUF)
        #[arg(long, default_value_t = false)]
        quantized: bool,

        /// Сохранить итоговый ответ в файл (UTF-8)
        #[arg(long)]
        out_text: Option<PathBuf>,
    },

    /// Run a simple test to verify the setup
    Test {
        /// Device to use (cpu, metal)
        #[arg(long, default_value = "cpu")]
        device: String,
    },

    /// Операции над директориями моделей
    Models {
        #[command(subcommand)]
        command: ModelsCommands,
    },
}

#[derive(Subcommand)]
enum ModelsCommands {
    /// Показать модели в директории (по умолчанию ./models)
    List {
        /// Директория, в которой лежат подпапки с моделями
        #[arg(long, default_value = "models")]
        root: PathBuf,
    },

    /// Проверить конкретную директорию модели и вывести, какие файлы найдены
    Check {
        /// Путь к директории модели
        #[arg(long)]
        model: PathBuf,
    },
}

fn create_device(name: &str) -> Result<candle_core::Device> {
    match name {
        "metal" => Ok(lm_core::metal_utils::create_safe_metal_device()?),
        "cuda" => Ok(candle_core::Device::new_cuda(0)?),
        _ => Ok(candle_core::Device::Cpu),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Generate {
            model,
            arch,
            prompt,
            device,
            max_tokens,
            temperature,
            top_k,
            top_p,
            seed,
            flush_interval_ms,
            raw,
            quantized,
            out_text,
        } => {
            println!("💬 RustLM - Streaming Text Generation");
            println!("=====================================");
            println!("Model: {}", model.display());
            println!("Arch: {:?}", arch);
            println!("Device: {}", device);
            println!();

            let device = create_device(&device)?;

            println!("📂 Loading model...");
            let arch = arch.to_arch_type();
            let engine = if quantized {
                LmEngine::load_quantized(arch, &model, &device)?
            } else {
                LmEngine::load(arch, &model, &device)?
            };
            let info = engine.model_info();
            println!(
                "   {} | {} | {} слоёв",
                info.display_name, info.quantization, info.num_layers
            );
            println!();

            let mut sampling = SamplingParams::default().with_temperature(temperature);
            sampling.top_k = top_k;
            sampling.top_p = top_p;
            sampling.seed = seed;

            let opts = GenerateOptions::default()
                .with_max_new_tokens(max_tokens)
                .with_sampling(sampling)
                .with_min_emit_interval(Duration::from_millis(flush_interval_ms));

            let mut stream = if raw {
                engine.start_session_raw(&prompt, opts)?
            } else {
                engine.start_session(&prompt, opts)?
            };

            let mut response = String::new();
            let mut last_stats = None;
            let mut stdout = std::io::stdout();

            loop {
                match stream.next_fragment() {
                    Ok(Some(Fragment::Text(text))) => {
                        print!("{text}");
                        stdout.flush()?;
                        response.push_str(&text);
                    }
                    Ok(Some(Fragment::Stats(stats))) => {
                        last_stats = Some(stats);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        println!();
                        return Err(anyhow::anyhow!("Генерация прервана: {e}"));
                    }
                }
            }
            println!();
            println!();

            if let Some(stats) = last_stats {
                println!(
                    "⚡ {} токенов за {:.1}с ({:.1} tok/s)",
                    stats.tokens, stats.elapsed_secs, stats.tokens_per_sec
                );
            }
            if let Some(reason) = stream.finish_reason() {
                println!("🏁 Завершение: {:?}", reason);
            }

            if let Some(path) = out_text {
                std::fs::write(&path, &response)?;
                println!("💾 Ответ сохранён: {}", path.display());
            }

            Ok(())
        }

        Commands::Test { device } => {
            println!("🧪 RustLM - Setup Test");
            println!("======================");

            let device = match device.as_str() {
                "metal" => {
                    println!("Testing Metal device...");
                    create_device("metal")?
                }
                _ => {
                    println!("Testing CPU device...");
                    create_device("cpu")?
                }
            };

            let a = candle_core::Tensor::randn(0f32, 1f32, (2, 3), &device)?;
            let b = candle_core::Tensor::randn(0f32, 1f32, (3, 4), &device)?;
            let c = a.matmul(&b)?;
            println!("✅ Test passed. Output shape: {:?}", c.dims());
            Ok(())
        }

        Commands::Models { command } => match command {
            ModelsCommands::List { root } => {
                println!("📚 Модели в {}:", root.display());
                let mut found = 0usize;
                for entry in std::fs::read_dir(&root)? {
                    let entry = entry?;
                    let dir = entry.path();
                    if !dir.is_dir() || !dir.join("config.json").exists() {
                        continue;
                    }
                    found += 1;
                    let arch = detect_arch(&dir)
                        .map(|a| a.display_name().to_string())
                        .unwrap_or_else(|| "неизвестная архитектура".to_string());
                    let size = lm_core::model_files::weights_total_size(&dir)
                        .map(|b| format!("{:.1} GB", b as f64 / 1e9))
                        .unwrap_or_else(|| "веса не найдены".to_string());
                    println!(
                        "   {} — {} ({})",
                        entry.file_name().to_string_lossy(),
                        arch,
                        size
                    );
                }
                if found == 0 {
                    println!("   (пусто: нет поддиректорий с config.json)");
                }
                Ok(())
            }

            ModelsCommands::Check { model } => {
                println!("🔍 Проверка {}:", model.display());

                let config = model.join("config.json");
                println!(
                    "   config.json: {}",
                    if config.exists() { "✅" } else { "❌" }
                );
                if let Some(arch) = detect_arch(&model) {
                    println!("   архитектура: {}", arch.display_name());
                }

                let tokenizer = model.join("tokenizer.json");
                println!(
                    "   tokenizer.json: {}",
                    if tokenizer.exists() { "✅" } else { "❌" }
                );

                match lm_core::model_files::resolve_safetensors_files(&model) {
                    Ok(files) => println!("   safetensors: ✅ ({} файлов)", files.len()),
                    Err(e) => println!("   safetensors: ❌ ({e})"),
                }

                match lm_core::model_files::find_preferred_gguf(&model) {
                    Some(p) => println!(
                        "   gguf: ✅ ({})",
                        p.file_name().unwrap_or_default().to_string_lossy()
                    ),
                    None => println!("   gguf: — (не найден, будет использован safetensors)"),
                }

                Ok(())
            }
        },
    }
}

/// Определить архитектуру по `model_type` из config.json.
fn detect_arch(model_dir: &std::path::Path) -> Option<lm_core::ArchType> {
    let content = std::fs::read_to_string(model_dir.join("config.json")).ok()?;
    let value: serde_json::Value = serde_json::from_str(&content).ok()?;
    let model_type = value.get("model_type")?.as_str()?;
    lm_core::ArchType::from_str_loose(model_type)
}
