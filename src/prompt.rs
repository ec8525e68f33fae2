// =============================================================================
// Interactive prompts
// =============================================================================
//
// Line-oriented questions on any `BufRead`/`Write` pair (stdin/stdout in the
// binary, in-memory buffers in tests). Invalid answers are asked again; a
// closed input is an error.
// =============================================================================

use std::collections::HashSet;
use std::io::{BufRead, Write};

use anyhow::{bail, Context, Result};

use crate::types::Symbol;

/// Pairs the bot trades against.
pub const SUPPORTED_PAIRS: [&str; 2] = ["BTC", "ETH"];

pub struct Prompter<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Prompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// Print a line that is not a question.
    pub fn say(&mut self, line: &str) -> Result<()> {
        writeln!(self.output, "{line}").context("failed to write to terminal")
    }

    /// Ask `question` and return the trimmed answer.
    pub fn ask(&mut self, question: &str) -> Result<String> {
        write!(self.output, "{question}").context("failed to write prompt")?;
        self.output.flush().context("failed to flush prompt")?;

        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .context("failed to read answer")?;
        if read == 0 {
            bail!("input closed while waiting for an answer");
        }
        Ok(line.trim().to_string())
    }

    pub fn ask_upper(&mut self, question: &str) -> Result<String> {
        Ok(self.ask(question)?.to_uppercase())
    }

    /// Ask until the answer parses as a finite number.
    pub fn ask_f64(&mut self, question: &str) -> Result<f64> {
        loop {
            let answer = self.ask(question)?;
            match answer.parse::<f64>() {
                Ok(v) if v.is_finite() => return Ok(v),
                _ => self.say(&format!("[-] '{answer}' IS NOT A NUMBER"))?,
            }
        }
    }

    /// Ask for one of the supported pairs.
    pub fn ask_pair(&mut self) -> Result<String> {
        let mut pair = self.ask_upper("[+] ENTER PAIR (BTC|ETH): ")?;
        while !SUPPORTED_PAIRS.contains(&pair.as_str()) {
            pair = self.ask_upper(&format!("[-] PAIR {pair} NOT SUPPORTED, PLEASE RE-ENTER: "))?;
        }
        Ok(pair)
    }

    /// Ask for a ticker until `TICKER/pair` is a listed market.
    pub fn ask_ticker(&mut self, pair: &str, markets: &HashSet<Symbol>) -> Result<Symbol> {
        let mut ticker = self.ask_upper("[PUMP BOT READY] | ENTER TICKER TO START: ")?;
        loop {
            let symbol = Symbol::new(&ticker, pair);
            if !ticker.is_empty() && markets.contains(&symbol) {
                return Ok(symbol);
            }
            ticker = self.ask_upper(&format!("[-] TICKER {ticker} NOT FOUND, PLEASE RE-ENTER: "))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn prompter(input: &str) -> Prompter<Cursor<Vec<u8>>, Vec<u8>> {
        Prompter::new(Cursor::new(input.as_bytes().to_vec()), Vec::new())
    }

    #[test]
    fn numbers_are_reasked_until_valid() {
        let mut p = prompter("abc\n\n12.5\n");
        assert_eq!(p.ask_f64("? ").unwrap(), 12.5);
        let out = String::from_utf8(p.output).unwrap();
        assert_eq!(out.matches("? ").count(), 3);
        assert!(out.contains("'abc' IS NOT A NUMBER"));
    }

    #[test]
    fn pair_is_uppercased_and_validated() {
        let mut p = prompter("usdt\neth\n");
        assert_eq!(p.ask_pair().unwrap(), "ETH");
    }

    #[test]
    fn ticker_must_be_listed_against_the_pair() {
        let markets: HashSet<Symbol> = [Symbol::new("TRX", "ETH"), Symbol::new("ADA", "BTC")]
            .into_iter()
            .collect();
        let mut p = prompter("ada\ntrx\n");
        assert_eq!(p.ask_ticker("ETH", &markets).unwrap(), Symbol::new("TRX", "ETH"));
        let out = String::from_utf8(p.output).unwrap();
        assert!(out.contains("TICKER ADA NOT FOUND"));
    }

    #[test]
    fn closed_input_is_an_error() {
        let mut p = prompter("");
        assert!(p.ask("? ").is_err());
    }
}
