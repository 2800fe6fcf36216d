use tokenizers::Tokenizer;

use crate::FileLoader;

/// Load the `tokenizer.json` of a repository.
///
/// Repositories shipping only `vocab.json` and `merges.txt` are rejected: those need pre-tokenizer and
/// post-processor settings that only a full `tokenizer.json` records.
pub fn load_tokenizer(loader: &FileLoader, files: &[String]) -> anyhow::Result<Tokenizer> {
    if !files.iter().any(|f| f == "tokenizer.json") {
        anyhow::bail!("Expected `tokenizer.json` file present.");
    }
    let file = loader.read_file("tokenizer.json")?;
    Tokenizer::from_file(file.path()).map_err(anyhow::Error::msg)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::load_tokenizer;
    use crate::{FileLoader, ModelSource, TokenSource};

    const TOKENIZER_JSON: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": {"<unk>": 0, "sky": 1}, "unk_token": "<unk>"}
    }"#;

    fn repo(name: &str, files: &[(&str, &str)]) -> anyhow::Result<FileLoader> {
        let dir = std::env::temp_dir().join(format!("dalle_rs_tok_{}_{name}", std::process::id()));
        fs::create_dir_all(&dir)?;
        for (file, contents) in files {
            fs::write(dir.join(file), contents)?;
        }
        FileLoader::from_model_source(&ModelSource::local(&dir), true, &TokenSource::None, None)
    }

    #[test]
    fn loads_tokenizer_json() -> anyhow::Result<()> {
        let loader = repo("json", &[("tokenizer.json", TOKENIZER_JSON)])?;
        let tokenizer = load_tokenizer(&loader, &loader.list_files()?)?;
        let encoding = tokenizer.encode("sky", false).map_err(anyhow::Error::msg)?;
        assert_eq!(encoding.get_ids(), &[1]);
        Ok(())
    }

    #[test]
    fn vocab_and_merges_alone_are_rejected() -> anyhow::Result<()> {
        let loader = repo("bpe", &[("vocab.json", "{}"), ("merges.txt", "")])?;
        assert!(load_tokenizer(&loader, &loader.list_files()?).is_err());
        Ok(())
    }
}
