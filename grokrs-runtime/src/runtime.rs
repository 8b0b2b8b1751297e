//! Prompt strings in, completion strings out
//!
//! [`Runtime`] encodes the prompt with its [`Tokenizer`], hands the ids to
//! the [`Engine`] and decodes what comes back.

use std::io::Write;

use grokrs::{Error, GenerateOptions, Model, ModelConfig, Result, Tokenizer};

use crate::engine::GenerationEvent;
use crate::Engine;

/// An [`Engine`] paired with the tokenizer its checkpoint was trained with.
pub struct Runtime<T: Tokenizer> {
    engine: Engine,
    tokenizer: T,
}

impl<T: Tokenizer> Runtime<T> {
    /// Create a runtime serving one model replica.
    ///
    /// # Errors
    /// See [`Runtime::from_engine`].
    pub fn new<M: Model + 'static>(model: M, tokenizer: T) -> Result<Self> {
        Self::from_engine(Engine::new(model)?, tokenizer)
    }

    /// Wrap an existing engine.
    ///
    /// # Errors
    /// Returns `ConfigInvalid` if the tokenizer can produce ids the model
    /// has no embedding for.
    pub fn from_engine(engine: Engine, tokenizer: T) -> Result<Self> {
        let vocab_size = engine.model_config().vocab_size;
        if tokenizer.vocab_size() > vocab_size {
            return Err(Error::ConfigInvalid(format!(
                "tokenizer vocabulary ({}) is larger than the model's ({vocab_size})",
                tokenizer.vocab_size()
            )));
        }
        Ok(Self { engine, tokenizer })
    }

    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    #[must_use]
    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    #[must_use]
    pub fn model_config(&self) -> &ModelConfig {
        self.engine.model_config()
    }

    /// Complete `prompt` and return only the new text.
    ///
    /// # Errors
    /// Propagates tokenizer and engine failures.
    pub fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String> {
        let input_ids = self.tokenizer.encode(prompt, true)?;
        let output_ids = self.engine.generate(&input_ids, options)?;
        self.tokenizer.decode(&output_ids)
    }

    /// Generate text, writing the completion to `out` as it is produced.
    ///
    /// Text is written whenever the decoded completion extends what was
    /// already written; a token that rewrites earlier text (for instance
    /// the tail of a multi-byte character) is held back until the
    /// completion is consistent again.
    ///
    /// Returns the completion ids.
    ///
    /// # Errors
    /// Propagates tokenizer, engine and I/O failures.
    pub fn generate_stream<W: Write>(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        out: &mut W,
    ) -> Result<Vec<u32>> {
        let input_ids = self.tokenizer.encode(prompt, true)?;
        let tokenizer = &self.tokenizer;

        self.engine.generate_stream(&input_ids, options, |rx| {
            let mut tokens = Vec::new();
            let mut written = String::new();
            for event in rx {
                match event {
                    GenerationEvent::Token(id) => {
                        tokens.push(id);
                        let text = tokenizer.decode(&tokens)?;
                        if let Some(new) = text.strip_prefix(written.as_str()) {
                            out.write_all(new.as_bytes())?;
                            out.flush()?;
                            written = text;
                        }
                    }
                    GenerationEvent::Error(e) => return Err(e),
                    GenerationEvent::Finished(_) => return Ok(tokens),
                }
            }
            Err(Error::InvalidState(
                "engine stopped before the request finished".into(),
            ))
        })
    }
}
