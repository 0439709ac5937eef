//! Prompt template lookup.
//!
//! Templates are addressed by `(namespace, key)` and rendered with `$name` or
//! `${name}` placeholders. Lookup tries the configured language first, then
//! the default language; within a language, override files win over the
//! built-in templates.
//!
//! Override files live at `<dir>/<lang>/<namespace>.toml` and map keys to
//! template strings:
//!
//! ```toml
//! # templates/en/rag.toml
//! footer_prompt = "Question: $query\nAnswer:"
//! ```
//!
//! A key that cannot be found anywhere renders as an empty string. Unknown
//! placeholders are left as written and `$$` renders a literal `$`.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use walkdir::WalkDir;

use crate::config::TemplatesConfig;

/// Template-lookup contract used by the answering path.
pub trait TemplateLookup: Send + Sync {
    fn get(&self, namespace: &str, key: &str, vars: Option<&HashMap<String, String>>) -> String;
}

type Overrides = HashMap<(String, String), HashMap<String, String>>;

/// Built-in templates plus optional on-disk overrides.
pub struct TemplateParser {
    language: String,
    default_language: String,
    overrides: Overrides,
}

impl TemplateParser {
    pub fn new(config: &TemplatesConfig) -> Result<Self> {
        let overrides = match &config.dir {
            Some(dir) => load_overrides(dir)?,
            None => HashMap::new(),
        };
        Ok(Self {
            language: config.language.clone(),
            default_language: config.default_language.clone(),
            overrides,
        })
    }

    /// Parser with built-in templates only.
    pub fn builtin(language: &str) -> Self {
        Self {
            language: language.to_string(),
            default_language: "en".to_string(),
            overrides: HashMap::new(),
        }
    }

    fn lookup(&self, lang: &str, namespace: &str, key: &str) -> Option<String> {
        self.overrides
            .get(&(lang.to_string(), namespace.to_string()))
            .and_then(|m| m.get(key).cloned())
            .or_else(|| builtin_template(lang, namespace, key).map(str::to_string))
    }
}

impl TemplateLookup for TemplateParser {
    fn get(&self, namespace: &str, key: &str, vars: Option<&HashMap<String, String>>) -> String {
        let template = self
            .lookup(&self.language, namespace, key)
            .or_else(|| self.lookup(&self.default_language, namespace, key));

        match template {
            Some(t) => substitute(&t, vars),
            None => {
                tracing::warn!(namespace, key, language = %self.language, "template not found");
                String::new()
            }
        }
    }
}

fn load_overrides(dir: &Path) -> Result<Overrides> {
    let mut overrides = HashMap::new();
    if !dir.exists() {
        return Ok(overrides);
    }

    for entry in WalkDir::new(dir).min_depth(2).max_depth(2) {
        let entry = entry.with_context(|| format!("Failed to scan {}", dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        let (Some(lang), Some(namespace)) = (
            path.parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str()),
            path.file_stem().and_then(|s| s.to_str()),
        ) else {
            continue;
        };

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read template file: {}", path.display()))?;
        let table: HashMap<String, String> = toml::from_str(&content)
            .with_context(|| format!("Failed to parse template file: {}", path.display()))?;
        overrides.insert((lang.to_string(), namespace.to_string()), table);
    }

    Ok(overrides)
}

/// Render `$name` / `${name}` placeholders. Unknown names stay verbatim.
pub fn substitute(template: &str, vars: Option<&HashMap<String, String>>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(stripped) = after.strip_prefix('$') {
            out.push('$');
            rest = stripped;
            continue;
        }

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match vars.and_then(|v| v.get(name)).filter(|_| !name.is_empty()) {
            Some(value) => {
                out.push_str(value);
                rest = &after[consumed..];
            }
            None => {
                out.push('$');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

fn builtin_template(lang: &str, namespace: &str, key: &str) -> Option<&'static str> {
    match (lang, namespace, key) {
        ("en", "rag", "system_prompt") => Some(concat!(
            "You are an assistant that answers the user's question.\n",
            "You will be given a set of documents related to the user's query.\n",
            "Answer using only the documents provided.\n",
            "Ignore documents that are not relevant to the question.\n",
            "If the documents do not contain the answer, apologize and say so.\n",
            "Answer in the same language as the user's question.\n",
            "Be polite and respectful.\n",
            "Be precise and concise. Avoid unnecessary information.",
        )),
        ("en", "rag", "document_prompt") => {
            Some("## Document No: $doc_num\n### Content: $chunk_text")
        }
        ("en", "rag", "footer_prompt") => Some(concat!(
            "Based only on the above documents, please generate an answer for the user.\n",
            "## Question:\n",
            "$query\n",
            "\n",
            "## Answer:",
        )),
        ("ar", "rag", "system_prompt") => Some(concat!(
            "أنت مساعد يجيب عن سؤال المستخدم.\n",
            "سيتم تزويدك بمجموعة من المستندات المرتبطة باستفسار المستخدم.\n",
            "أجب بالاعتماد على المستندات المقدمة فقط.\n",
            "تجاهل المستندات غير المتعلقة بالسؤال.\n",
            "إذا لم تحتوِ المستندات على الإجابة فاعتذر للمستخدم.\n",
            "أجب بنفس لغة سؤال المستخدم.\n",
            "كن مهذبا ومحترما.\n",
            "كن دقيقا وموجزا وتجنب المعلومات غير الضرورية.",
        )),
        ("ar", "rag", "document_prompt") => Some("## المستند رقم: $doc_num\n### المحتوى: $chunk_text"),
        ("ar", "rag", "footer_prompt") => Some(concat!(
            "بناء على المستندات السابقة فقط، يرجى توليد إجابة للمستخدم.\n",
            "## السؤال:\n",
            "$query\n",
            "\n",
            "## الإجابة:",
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_substitute_forms() {
        let v = vars(&[("name", "Ada"), ("n", "3")]);
        assert_eq!(substitute("hi $name", Some(&v)), "hi Ada");
        assert_eq!(substitute("${n}rd", Some(&v)), "3rd");
        assert_eq!(substitute("$$5 for $name", Some(&v)), "$5 for Ada");
        assert_eq!(substitute("keep $other", Some(&v)), "keep $other");
        assert_eq!(substitute("trailing $", Some(&v)), "trailing $");
        assert_eq!(substitute("no vars $name", None), "no vars $name");
    }

    #[test]
    fn test_builtin_document_prompt() {
        let parser = TemplateParser::builtin("en");
        let out = parser.get(
            "rag",
            "document_prompt",
            Some(&vars(&[("doc_num", "1"), ("chunk_text", "Some text")])),
        );
        assert_eq!(out, "## Document No: 1\n### Content: Some text");
    }

    #[test]
    fn test_missing_key_is_empty() {
        let parser = TemplateParser::builtin("en");
        assert_eq!(parser.get("rag", "nope", None), "");
        assert_eq!(parser.get("other", "system_prompt", None), "");
    }

    #[test]
    fn test_falls_back_to_default_language() {
        let parser = TemplateParser::builtin("fr");
        assert!(parser
            .get("rag", "system_prompt", None)
            .starts_with("You are an assistant"));
    }

    #[test]
    fn test_arabic_templates() {
        let parser = TemplateParser::builtin("ar");
        let out = parser.get("rag", "footer_prompt", Some(&vars(&[("query", "ما هذا؟")])));
        assert!(out.contains("ما هذا؟"));
    }

    #[test]
    fn test_override_file_wins() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("en")).unwrap();
        std::fs::write(
            dir.path().join("en").join("rag.toml"),
            "footer_prompt = \"Q: $query\"\n",
        )
        .unwrap();

        let config = TemplatesConfig {
            language: "en".to_string(),
            default_language: "en".to_string(),
            dir: Some(dir.path().to_path_buf()),
        };
        let parser = TemplateParser::new(&config).unwrap();
        assert_eq!(
            parser.get("rag", "footer_prompt", Some(&vars(&[("query", "why?")]))),
            "Q: why?"
        );
        // Keys absent from the override still resolve to built-ins.
        assert!(!parser.get("rag", "system_prompt", None).is_empty());
    }
}
