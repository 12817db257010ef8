use anyhow::Result;
use kbchat_core::api::{KnowledgeBase, KnowledgeBaseFile};
use serde_json::Value;

pub fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_knowledge_bases(bases: &[KnowledgeBase], current: Option<&str>) {
    if bases.is_empty() {
        println!("No knowledge bases.");
        return;
    }
    for base in bases {
        let marker = if Some(base.kb_name.as_str()) == current { '*' } else { ' ' };
        let mut line = format!("{marker} {}", base.kb_name);
        if let Some(model) = &base.embedding_model {
            line.push_str(&format!("  [{model}]"));
        }
        if let Some(info) = base.kb_info.as_deref().filter(|info| !info.is_empty()) {
            line.push_str(&format!("  {info}"));
        }
        println!("{line}");
    }
}

pub fn print_files(files: &[KnowledgeBaseFile]) {
    if files.is_empty() {
        println!("No files.");
        return;
    }
    for file in files {
        match file.docs_count {
            Some(count) => println!("{}  ({count} chunks)", file.file_name),
            None => println!("{}", file.file_name),
        }
    }
}
