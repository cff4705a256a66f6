use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::prompting::PromptFamily;

#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub id: String,
    pub path: PathBuf,
    pub family: PromptFamily,
    pub tokenizer_path: Option<PathBuf>,
    pub tokenizer_config_path: Option<PathBuf>,
}

/// GGUF models found under one directory.
#[derive(Debug)]
pub struct ModelCatalog {
    entries: Vec<ModelEntry>,
}

impl ModelCatalog {
    pub fn discover(models_dir: impl Into<PathBuf>) -> Result<Self, String> {
        let models_dir = models_dir.into();
        let mut gguf_files = Vec::new();
        collect_gguf_files(&models_dir, &mut gguf_files)?;

        let mut entries: Vec<ModelEntry> = gguf_files
            .into_iter()
            .map(|path| build_entry(&models_dir, path))
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }
}

/// Resolves the `model_path` handed to a pipeline: either a `.gguf` file or
/// a model directory. A directory holding several models resolves to the
/// first one by id.
pub fn resolve_model(model_path: &Path) -> Result<ModelEntry, String> {
    if model_path.is_file() {
        let extension = model_path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        if !extension.eq_ignore_ascii_case("gguf") {
            return Err(format!(
                "Unsupported model file '{}': expected a .gguf file",
                model_path.display()
            ));
        }
        let dir = model_path.parent().unwrap_or(Path::new("."));
        return Ok(build_entry(dir, model_path.to_path_buf()));
    }

    if !model_path.is_dir() {
        return Err(format!("Model path not found: {}", model_path.display()));
    }

    let catalog = ModelCatalog::discover(model_path)?;
    if catalog.entries().len() > 1 {
        warn!(
            models = catalog.entries().len(),
            dir = %model_path.display(),
            "several GGUF models found, using the first one"
        );
    }

    catalog
        .entries
        .into_iter()
        .next()
        .ok_or_else(|| format!("No GGUF model found in {}", model_path.display()))
}

fn build_entry(models_dir: &Path, path: PathBuf) -> ModelEntry {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown-model")
        .to_string();

    ModelEntry {
        id: build_model_id(models_dir, &path),
        family: PromptFamily::infer(&stem),
        tokenizer_path: infer_sibling(models_dir, &path, "tokenizer.json"),
        tokenizer_config_path: infer_sibling(models_dir, &path, "tokenizer_config.json"),
        path,
    }
}

fn collect_gguf_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), String> {
    let entries = fs::read_dir(dir)
        .map_err(|e| format!("Model directory read failed '{}': {}", dir.display(), e))?;

    for entry in entries {
        let path = entry
            .map_err(|e| format!("Model directory entry read failed '{}': {}", dir.display(), e))?
            .path();

        if path.is_dir() {
            collect_gguf_files(&path, out)?;
            continue;
        }

        if !path.is_file() {
            continue;
        }

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        if extension.eq_ignore_ascii_case("gguf") {
            out.push(path);
        }
    }

    Ok(())
}

fn build_model_id(models_dir: &Path, model_path: &Path) -> String {
    let mut without_ext = model_path
        .strip_prefix(models_dir)
        .unwrap_or(model_path)
        .to_path_buf();
    without_ext.set_extension("");
    without_ext.to_string_lossy().replace('\\', "/")
}

/// Looks for `file_name` next to the weights, then at the catalog root.
fn infer_sibling(models_dir: &Path, model_path: &Path, file_name: &str) -> Option<PathBuf> {
    let model_parent = model_path.parent().unwrap_or(models_dir);
    let local = model_parent.join(file_name);
    if local.exists() {
        return Some(local);
    }

    let root = models_dir.join(file_name);
    if root.exists() {
        return Some(root);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn discovers_models_recursively_in_family_subdirs() {
        let base = mk_temp_dir("genai_catalog_recursive");
        let llama_dir = base.join("llama3.1-8b");
        let qwen_dir = base.join("qwen2.5-0.5b");

        fs::create_dir_all(&llama_dir).expect("create llama dir");
        fs::create_dir_all(&qwen_dir).expect("create qwen dir");

        fs::write(llama_dir.join("Meta-Llama-3.1-8B-Instruct-Q4_K_M.gguf"), b"stub")
            .expect("write llama stub");
        fs::write(qwen_dir.join("Qwen2.5-0.5B-Instruct-Q4_K_M.gguf"), b"stub")
            .expect("write qwen stub");
        fs::write(llama_dir.join("tokenizer.json"), b"{}").expect("write llama tokenizer");

        let catalog = ModelCatalog::discover(&base).expect("discover models recursively");
        assert_eq!(catalog.entries().len(), 2);

        let llama = catalog
            .entries()
            .iter()
            .find(|e| e.id == "llama3.1-8b/Meta-Llama-3.1-8B-Instruct-Q4_K_M")
            .expect("llama entry present");
        assert_eq!(llama.family, PromptFamily::Llama);
        assert!(llama
            .tokenizer_path
            .as_ref()
            .expect("tokenizer expected")
            .ends_with("llama3.1-8b/tokenizer.json"));

        let qwen = catalog
            .entries()
            .iter()
            .find(|e| e.family == PromptFamily::Qwen)
            .expect("qwen entry present");
        assert!(qwen.tokenizer_path.is_none());

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn resolves_model_directory_and_file() {
        let base = mk_temp_dir("genai_catalog_resolve");
        fs::create_dir_all(&base).expect("create dir");
        let model = base.join("qwen2-1.5b-instruct-q4_0.gguf");
        fs::write(&model, b"stub").expect("write stub");
        fs::write(base.join("tokenizer_config.json"), b"{}").expect("write config");

        let from_dir = resolve_model(&base).expect("resolve dir");
        assert_eq!(from_dir.path, model);
        assert_eq!(from_dir.family, PromptFamily::Qwen);
        assert_eq!(from_dir.tokenizer_config_path, Some(base.join("tokenizer_config.json")));

        let from_file = resolve_model(&model).expect("resolve file");
        assert_eq!(from_file.id, "qwen2-1.5b-instruct-q4_0");

        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn missing_or_empty_paths_are_errors() {
        let base = mk_temp_dir("genai_catalog_empty");
        assert!(resolve_model(&base).unwrap_err().contains("not found"));

        fs::create_dir_all(&base).expect("create dir");
        assert!(resolve_model(&base).unwrap_err().contains("No GGUF model"));

        let not_gguf = base.join("model.bin");
        fs::write(&not_gguf, b"stub").expect("write stub");
        assert!(resolve_model(&not_gguf).unwrap_err().contains("expected a .gguf"));

        let _ = fs::remove_dir_all(base);
    }

    fn mk_temp_dir(prefix: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time ok")
            .as_nanos();
        std::env::temp_dir().join(format!("{}_{}_{}", prefix, std::process::id(), ts))
    }
}
