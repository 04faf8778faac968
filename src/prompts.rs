//! Prompt templates for multiple-choice reasoning questions.
//!
//! Domain logic for rendering evaluation prompts. Provider-agnostic.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dataset::{normalize_category, EvaluationSample};

// =============================================================================
// Strategies
// =============================================================================

/// Prompting strategy under evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    ZeroShot,
    FewShot,
    ZeroShotCot,
    FewShotCot,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::ZeroShot,
        Strategy::FewShot,
        Strategy::ZeroShotCot,
        Strategy::FewShotCot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::ZeroShot => "zero_shot",
            Strategy::FewShot => "few_shot",
            Strategy::ZeroShotCot => "zero_shot_cot",
            Strategy::FewShotCot => "few_shot_cot",
        }
    }

    pub fn uses_examples(&self) -> bool {
        matches!(self, Strategy::FewShot | Strategy::FewShotCot)
    }

    pub fn uses_reasoning(&self) -> bool {
        matches!(self, Strategy::ZeroShotCot | Strategy::FewShotCot)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Strategy::ALL
            .iter()
            .find(|st| st.as_str() == s.trim())
            .copied()
            .ok_or_else(|| format!("unknown strategy: {s}"))
    }
}

/// Which worked-example set a few-shot prompt splices in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Quantitative,
    Logical,
}

impl TaskType {
    /// Logical when the category names logic in any form; quantitative otherwise.
    pub fn from_category(category: &str) -> Self {
        if normalize_category(category).split('&').any(|label| label == "L") {
            TaskType::Logical
        } else {
            TaskType::Quantitative
        }
    }
}

// =============================================================================
// Templates
// =============================================================================

/// Per-language wording for every part of a prompt.
struct LanguagePack {
    zero_shot: &'static str,
    few_shot: &'static str,
    zero_shot_cot: &'static str,
    few_shot_cot: &'static str,
    quantitative_examples: &'static str,
    logical_examples: &'static str,
    quantitative_cot_examples: &'static str,
    logical_cot_examples: &'static str,
    options_header: &'static str,
    options_footer: &'static str,
    json_instruction: &'static str,
}

impl LanguagePack {
    fn template(&self, strategy: Strategy) -> &'static str {
        match strategy {
            Strategy::ZeroShot => self.zero_shot,
            Strategy::FewShot => self.few_shot,
            Strategy::ZeroShotCot => self.zero_shot_cot,
            Strategy::FewShotCot => self.few_shot_cot,
        }
    }

    fn examples(&self, strategy: Strategy, task: TaskType) -> &'static str {
        match (strategy.uses_reasoning(), task) {
            (false, TaskType::Quantitative) => self.quantitative_examples,
            (false, TaskType::Logical) => self.logical_examples,
            (true, TaskType::Quantitative) => self.quantitative_cot_examples,
            (true, TaskType::Logical) => self.logical_cot_examples,
        }
    }
}

const ZH: LanguagePack = LanguagePack {
    zero_shot: "请回答以下问题，只输出最终答案：\n问题: {question}",
    few_shot: "{examples}\n\n请回答:\n问题: {question}\n答案:",
    zero_shot_cot: "请回答以下问题，逐步思考，最后给出答案。\n问题: {question}",
    few_shot_cot: "{examples}\n\n请回答:\n问题: {question}\n思考过程:",
    quantitative_examples: r#"示例1:
问题: 一个篮子里有5个苹果，又放进去了3个，后来吃掉了2个，篮子里还剩几个苹果？
答案: 6个

示例2:
问题: 一辆车以60公里/小时的速度行驶了2小时，它行驶了多少公里？
答案: 120公里"#,
    logical_examples: r#"示例1:
问题: 前提A：所有的人都会死。前提B：苏格拉底是人。结论是什么？
答案: 苏格拉底会死。

示例2:
问题: 如果今天是星期三，那么后天是星期几？
答案: 星期五"#,
    quantitative_cot_examples: r#"示例1:
问题: 一个篮子里有5个苹果，又放进去了3个，后来吃掉了2个，篮子里还剩几个苹果？
思考过程: 初始有5个苹果。放进去3个后，苹果总数是 5 + 3 = 8个。然后吃掉了2个，所以剩下的苹果是 8 - 2 = 6个。
答案: 6个

示例2:
问题: 一辆车以60公里/小时的速度行驶了2小时，它行驶了多少公里？
思考过程: 距离等于速度乘以时间。速度是60公里/小时，时间是2小时。所以总距离是 60 * 2 = 120公里。
答案: 120公里"#,
    logical_cot_examples: r#"示例1:
问题: 前提A：所有的人都会死。前提B：苏格拉底是人。结论是什么？
思考过程: 这是一个三段论推理。大前提是“所有的人都会死”，小前提是“苏格拉底是人”。根据逻辑规则，可以得出结论“苏格拉底会死”。
答案: 苏格拉底会死。

示例2:
问题: 如果今天是星期三，那么后天是星期几？
思考过程: 今天是星期三。明天是星期四。后天就是星期五。
答案: 星期五"#,
    options_header: "选项：",
    options_footer: "请仅从 A/B/C/D 四个选项中选择一个。",
    json_instruction: r#"你需要以严格的 JSON 格式返回答案，且只能返回 JSON，对其它任何文本都不允许。
返回的 JSON 结构必须包含三个字段：
  - choice: 一个字符，代表模型选择的选项（A/B/C/D），若无法确定请返回空字符串 ""。
  - reason: 字符串，简短的逐步推理或一句话解释（最多 200 字）。
  - self_judgment: 字符串，模型自我判断该选择是否正确，值必须是 'correct' 或 'incorrect'（小写）。
例如： {"choice": "A", "reason": "因为...", "self_judgment": "correct"}
注意：只允许输出 JSON，不要包含任何额外的文字或说明。"#,
};

const EN: LanguagePack = LanguagePack {
    zero_shot: "Answer the following question and output only the final result.\nQuestion: {question}",
    few_shot: "{examples}\n\nNow answer:\nQuestion: {question}\nAnswer:",
    zero_shot_cot: "Answer the following question. Think step by step, then give the final result.\nQuestion: {question}",
    few_shot_cot: "{examples}\n\nNow answer:\nQuestion: {question}\nReasoning:",
    quantitative_examples: r#"Example 1:
Question: A basket holds 5 apples. 3 more are added and 2 are eaten. How many apples are left?
Answer: 6 apples

Example 2:
Question: A car travels at 60 km/h for 2 hours. How far does it go?
Answer: 120 km"#,
    logical_examples: r#"Example 1:
Question: Premise 1: all humans are mortal. Premise 2: Socrates is human. What follows?
Answer: Socrates is mortal.

Example 2:
Question: If today is Wednesday, what day is the day after tomorrow?
Answer: Friday"#,
    quantitative_cot_examples: r#"Example 1:
Question: A basket holds 5 apples. 3 more are added and 2 are eaten. How many apples are left?
Reasoning: There are 5 apples at first. After adding 3 there are 5 + 3 = 8. Eating 2 leaves 8 - 2 = 6.
Answer: 6 apples

Example 2:
Question: A car travels at 60 km/h for 2 hours. How far does it go?
Reasoning: Distance is speed times time, so 60 * 2 = 120 km.
Answer: 120 km"#,
    logical_cot_examples: r#"Example 1:
Question: Premise 1: all humans are mortal. Premise 2: Socrates is human. What follows?
Reasoning: This is a syllogism. The major premise covers every human and Socrates is one, so the conclusion follows.
Answer: Socrates is mortal.

Example 2:
Question: If today is Wednesday, what day is the day after tomorrow?
Reasoning: Tomorrow is Thursday, so the day after is Friday.
Answer: Friday"#,
    options_header: "Options:",
    options_footer: "Choose exactly one of A/B/C/D.",
    json_instruction: r#"Return ONLY a strict JSON object (no extra text). The JSON must contain exactly three fields:
  - choice: string, one of "A" / "B" / "C" / "D"; if unsure, return an empty string "".
  - reason: string, a short step-by-step rationale or one-sentence explanation (max 200 characters).
  - self_judgment: string, model's self-assessment, MUST be either "correct" or "incorrect" (lowercase).
Example: {"choice":"A", "reason":"Because...", "self_judgment":"correct"}
Note: Output only JSON, do NOT include any other text."#,
};

fn language_pack(language: &str) -> &'static LanguagePack {
    if language.eq_ignore_ascii_case("en") {
        &EN
    } else {
        &ZH
    }
}

// =============================================================================
// Leakage guard
// =============================================================================

/// Phrases that introduce an answer key.
pub const LEAK_TOKENS: &[&str] = &[
    "标准答案",
    "standard_answer",
    "standard answer",
    "参考答案",
    "答案:",
    "答案：",
    "answer:",
    "reference answer",
];

const SNIPPET_CHARS: usize = 120;

/// The rendered prompt states the ground-truth letter.
#[derive(Debug, Clone, thiserror::Error)]
#[error("answer leaked in prompt for {file}#{row_index}: '{token}' -> {letter} near \"{snippet}\"")]
pub struct LeakageError {
    pub file: String,
    pub row_index: u64,
    pub token: String,
    pub letter: String,
    pub snippet: String,
}

// The second group catches a trailing letter so "answer: because" is not read as B.
static LEAK_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    LEAK_TOKENS
        .iter()
        .map(|token| {
            let pattern = format!(
                r"(?i){}\s*[:：]?\s*([A-D])([A-Za-z0-9_]?)",
                regex::escape(token)
            );
            (
                *token,
                Regex::new(&pattern).expect("leak pattern is a valid regex"),
            )
        })
        .collect()
});

/// Fail when any leak token in `prompt` is followed by the ground-truth letter.
pub fn check_leakage(prompt: &str, sample: &EvaluationSample) -> Result<(), LeakageError> {
    let truth = sample.ground_truth.trim().to_uppercase();
    if truth.is_empty() {
        return Ok(());
    }

    for (token, re) in LEAK_PATTERNS.iter() {
        for caps in re.captures_iter(prompt) {
            let (Some(whole), Some(letter)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if caps.get(2).is_some_and(|m| !m.as_str().is_empty()) {
                continue;
            }
            let letter = letter.as_str().to_uppercase();
            if letter == truth {
                return Err(LeakageError {
                    file: sample.source_file.clone(),
                    row_index: sample.row_index,
                    token: (*token).to_string(),
                    letter,
                    snippet: snippet_around(prompt, whole.start()),
                });
            }
        }
    }
    Ok(())
}

fn snippet_around(text: &str, byte_start: usize) -> String {
    let prefix_chars = text[..byte_start].chars().count();
    let skip = prefix_chars.saturating_sub(SNIPPET_CHARS / 2);
    text.chars()
        .skip(skip)
        .take(SNIPPET_CHARS)
        .collect::<String>()
        .replace('\n', " ")
}

// =============================================================================
// Builder
// =============================================================================

/// Rendered prompt ready for the model.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub strategy: Strategy,
    pub task_type: TaskType,
    pub text: String,
}

/// Assembles strategy template, options block, and output instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptBuilder;

impl PromptBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(
        &self,
        strategy: Strategy,
        sample: &EvaluationSample,
        language: &str,
    ) -> Result<PromptInstance, LeakageError> {
        let pack = language_pack(language);
        let task_type = TaskType::from_category(&sample.category);

        let mut text = pack
            .template(strategy)
            .replace("{examples}", pack.examples(strategy, task_type))
            .replace("{question}", &sample.question);
        text.push_str("\n\n");

        if sample.has_options() {
            text.push_str(pack.options_header);
            text.push('\n');
            for label in ["A", "B", "C", "D"] {
                let option = sample.options.get(label).map(String::as_str).unwrap_or("");
                text.push_str(&format!("{label}. {option}\n"));
            }
            text.push('\n');
            text.push_str(pack.options_footer);
            text.push('\n');
        }
        text.push_str(pack.json_instruction);

        check_leakage(&text, sample)?;

        Ok(PromptInstance {
            strategy,
            task_type,
            text,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample(question: &str, answer: &str, category: &str) -> EvaluationSample {
        let options: BTreeMap<String, String> =
            [("A", "one"), ("B", "two"), ("C", "three"), ("D", "four")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
        EvaluationSample {
            source_file: "set.csv".into(),
            row_index: 4,
            question: question.into(),
            options,
            ground_truth: answer.into(),
            category: category.into(),
        }
    }

    #[test]
    fn strategy_names_round_trip() {
        for st in Strategy::ALL {
            assert_eq!(st.as_str().parse::<Strategy>().unwrap(), st);
        }
        assert!("chain".parse::<Strategy>().is_err());
        assert_eq!(serde_json::to_string(&Strategy::FewShotCot).unwrap(), "\"few_shot_cot\"");
    }

    #[test]
    fn zero_shot_prompt_has_options_and_instruction() {
        let p = PromptBuilder::new()
            .build(Strategy::ZeroShot, &sample("1+1?", "B", "Q"), "zh")
            .unwrap();
        assert!(p.text.starts_with("请回答以下问题"));
        assert!(p.text.contains("问题: 1+1?"));
        assert!(p.text.contains("选项：\nA. one\nB. two\nC. three\nD. four\n"));
        assert!(p.text.contains("请仅从 A/B/C/D 四个选项中选择一个。"));
        assert!(p.text.ends_with("不要包含任何额外的文字或说明。"));
    }

    #[test]
    fn few_shot_picks_examples_by_category() {
        let builder = PromptBuilder::new();
        let logical = builder
            .build(Strategy::FewShot, &sample("q", "A", "逻辑"), "zh")
            .unwrap();
        assert_eq!(logical.task_type, TaskType::Logical);
        assert!(logical.text.contains("苏格拉底"));

        let unknown = builder
            .build(Strategy::FewShotCot, &sample("q", "A", ""), "zh")
            .unwrap();
        assert_eq!(unknown.task_type, TaskType::Quantitative);
        assert!(unknown.text.contains("思考过程: 初始有5个苹果"));
        assert!(unknown.text.contains("问题: q\n思考过程:"));
    }

    #[test]
    fn english_language_uses_english_templates() {
        let p = PromptBuilder::new()
            .build(Strategy::FewShot, &sample("Which?", "A", "L"), "en")
            .unwrap();
        assert!(p.text.contains("Socrates is mortal."));
        assert!(p.text.contains("Options:\nA. one"));
        assert!(p.text.contains("Return ONLY a strict JSON object"));
    }

    #[test]
    fn options_block_omitted_without_options() {
        let mut s = sample("q", "A", "Q");
        s.options.clear();
        let p = PromptBuilder::new().build(Strategy::ZeroShot, &s, "zh").unwrap();
        assert!(!p.text.contains("选项："));
        assert!(p.text.contains("self_judgment"));
    }

    #[test]
    fn leaked_ground_truth_fails_the_build() {
        let s = sample("标准答案: A 以下哪个正确？", "A", "Q");
        let err = PromptBuilder::new()
            .build(Strategy::ZeroShot, &s, "zh")
            .unwrap_err();
        assert_eq!(err.token, "标准答案");
        assert_eq!(err.letter, "A");
        assert_eq!(err.file, "set.csv");
        assert_eq!(err.row_index, 4);
        assert!(err.snippet.contains("标准答案"));
    }

    #[test]
    fn non_matching_letter_does_not_fire() {
        let s = sample("标准答案: B 以下哪个正确？", "A", "Q");
        assert!(PromptBuilder::new().build(Strategy::ZeroShot, &s, "zh").is_ok());
    }

    #[test]
    fn guard_is_case_insensitive_and_scans_all_occurrences() {
        let s = sample("Answer: b ... later, ANSWER: c", "C", "Q");
        let err = check_leakage(&s.question, &s).unwrap_err();
        assert_eq!(err.letter, "C");
        assert_eq!(err.token, "answer:");
    }

    #[test]
    fn letter_followed_by_word_is_not_a_leak() {
        let s = sample("answer: because of the rule", "B", "Q");
        assert!(check_leakage(&s.question, &s).is_ok());
    }

    #[test]
    fn templates_never_leak_by_themselves() {
        let builder = PromptBuilder::new();
        for truth in ["A", "B", "C", "D"] {
            for st in Strategy::ALL {
                for lang in ["zh", "en"] {
                    for cat in ["Q", "L"] {
                        let s = sample("plain question", truth, cat);
                        assert!(builder.build(st, &s, lang).is_ok(), "{st} {lang} {cat} {truth}");
                    }
                }
            }
        }
    }
}
