//! Prompt construction strategies for summary generation.
//!
//! The realtime strategy folds new utterances into a rolling structured
//! summary; the final strategy looks back over the whole session. Prompts
//! are Japanese, matching the transcription language.

use crate::session::TranscriptionSegment;

/// Format segments as `[HH:MM:SS] text` lines.
pub fn format_segments(segments: &[TranscriptionSegment]) -> String {
    segments
        .iter()
        .map(|seg| format!("[{}] {}", seg.start_time.format("%H:%M:%S"), seg.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Inputs available to a prompt builder.
pub struct PromptContext<'a> {
    /// The current rolling summary, if any exists yet.
    pub previous_summary: Option<&'a str>,
    /// Recently summarized segments replayed for continuity.
    pub processed_segments: &'a [TranscriptionSegment],
    /// Segments not yet folded into any summary.
    pub new_segments: &'a [TranscriptionSegment],
}

/// A system prompt plus a user-prompt builder.
pub trait PromptStrategy: Send + Sync {
    fn system_prompt(&self) -> &'static str;
    fn build_user_prompt(&self, context: &PromptContext<'_>) -> String;
}

/// Incremental structuring of an ongoing conversation.
pub struct RealtimePromptStrategy;

impl PromptStrategy for RealtimePromptStrategy {
    fn system_prompt(&self) -> &'static str {
        "\
リアルタイム会話を構造化し、議事録を更新してください。

# 制約
- 修正報告・挨拶・前置き・思考過程を出力しないこと
- 指定フォーマット以外のテキストを含めないこと

# ノイズ補正
音声認識の誤変換・フィラー（\"えー\"等）を文脈から判断して修正・削除してください。

# 構造化ルール
- アクティブな話題: 詳細に記録
- 完了した話題: 大トピックと結論のみ残す（圧縮）

# 出力（Markdown）
## 🚀 現在の焦点
(現在話されている内容を1行で)

## 🌳 トピック・ツリー
- **話題1 (完了)**
  - [結論] 〇〇
- **話題2 (進行中)**
  - 議論ポイントA
    - [ToDo] 担当者・内容

## ⏱️ 直近ログ
(補正済み発言を時系列で3件程度)
"
    }

    fn build_user_prompt(&self, context: &PromptContext<'_>) -> String {
        let summary_text = context
            .previous_summary
            .unwrap_or("(まだ議事録はありません)");

        let transcript = if context.processed_segments.is_empty() {
            format_segments(context.new_segments)
        } else {
            format!(
                "{}\n\n--- ここから新しい発言 ---\n\n{}",
                format_segments(context.processed_segments),
                format_segments(context.new_segments)
            )
        };

        format!(
            "\
【現在の議事録】
{summary_text}

【直近の発言テキスト（音声認識生データ・誤字含む）】
{transcript}
"
        )
    }
}

/// Whole-session retrospective at shutdown.
pub struct FinalSummaryPromptStrategy;

impl PromptStrategy for FinalSummaryPromptStrategy {
    fn system_prompt(&self) -> &'static str {
        "\
会話全体を俯瞰し、包括的なサマリを生成してください。

# 制約
- 修正報告・挨拶・前置き・思考過程を出力しないこと
- 指定フォーマット以外のテキストを含めないこと

# ノイズ補正
音声認識の誤変換・フィラーを文脈から判断して修正・削除してください。

# 構造化
会話の性質（会議/講義/雑談/インタビュー等）を推定し、適切に構造化してください。

# 出力（Markdown）
## 📋 会話の概要
(全体を2-3行で。性質も含む)

## 🌳 トピック・ツリー
- **メイントピック1**
  - サブトピック1-1
    - [結論/要点] 〇〇
    - [ToDo] 担当者・内容

## 💡 重要ポイント
- [決定] 〇〇
- [ToDo] 担当者・内容（期限）
- [疑問] 未解決事項

## 🔑 キーワード
`キーワード1`, `キーワード2`, ...（5-10個）
"
    }

    fn build_user_prompt(&self, context: &PromptContext<'_>) -> String {
        format!(
            "\
以下は、会話の全文です（音声認識生データ・誤字含む）。
会話全体を俯瞰して、包括的なサマリを生成してください。

【全発言テキスト】
{}
",
            format_segments(context.new_segments)
        )
    }
}
