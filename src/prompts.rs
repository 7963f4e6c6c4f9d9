//! Prompt builders for every completion call in the loop.
//!
//! Each builder pins the exact output contract its parser expects (labeled
//! lines or a JSON envelope), so parser and prompt stay in one place per
//! stage and drift is caught by the round-trip tests.

/// Prompt version. Bump on any contract change.
pub const PROMPT_VERSION: &str = "1.2.0";

/// Retrieval quality assessment. Parsed by `retrieval::parse_quality_score`.
pub fn quality_assessment(query: &str, passages_block: &str) -> String {
    format!(
        "You are a retrieval quality assessor. Analyze how relevant the \
         retrieved passages are to the query. Score from 0 to 1, where 1 is \
         perfect relevance.\n\n\
         Query: {query}\n\n\
         Retrieved passages:\n{passages_block}\n\n\
         Respond on a single line in the form:\n\
         SCORE: X.XX | REASON: <brief explanation>"
    )
}

/// Speculative query reframing. Parsed by `retrieval::parse_reframed_queries`.
pub fn query_reframe(query: &str, quality_score: f64, quality_issues: &str) -> String {
    format!(
        "You are an expert at reformulating questions for better retrieval. \
         The initial retrieval for the query below was weak; generate \
         alternative query formulations that may retrieve better material.\n\n\
         Original query: {query}\n\
         Initial quality score: {quality_score:.2}\n\
         Observed problems: {quality_issues}\n\n\
         Generate 3 alternative formulations that:\n\
         1. Use different terminology or perspectives\n\
         2. Are more specific or break the concept down\n\
         3. Target a different aspect of the topic\n\n\
         Write each on its own line, prefixed with \"QUERY:\"."
    )
}

/// Initial draft generation. Parsed by `draft::parse_envelope`.
pub fn draft(query: &str, context: &str, domain_instruction: Option<&str>) -> String {
    let domain = domain_instruction.unwrap_or("");
    format!(
        "You are an expert problem solver and educator. Produce a complete, \
         well-structured answer with explicit step-by-step reasoning, using \
         ONLY the course material below. Do not emit template placeholders; \
         write real content grounded in the supplied context.\n{domain}\n\
         Query: {query}\n\n\
         Course material:\n{context}\n\n\
         Respond with machine-readable JSON only:\n\
         {{\n\
           \"draft_content\": \"<the actual answer>\",\n\
           \"chain_of_thought\": [\n\
             {{\"step\": 1, \"thought\": \"<reasoning for this step>\", \"confidence\": 0.9}}\n\
           ]\n\
         }}"
    )
}

/// Draft refinement from moderator feedback. Same envelope as [`draft`].
pub fn refine(query: &str, previous_draft: &str, feedback: &str, context: &str) -> String {
    format!(
        "You are refining a draft answer based on review feedback. Address \
         every issue raised while keeping what was correct. Do not echo the \
         previous draft unchanged and do not emit template placeholders.\n\n\
         Query: {query}\n\n\
         Previous draft:\n{previous_draft}\n\n\
         Feedback to address:\n{feedback}\n\n\
         Course material:\n{context}\n\n\
         Respond with machine-readable JSON only:\n\
         {{\n\
           \"draft_content\": \"<the improved answer>\",\n\
           \"chain_of_thought\": [\n\
             {{\"step\": 1, \"thought\": \"<reasoning for this step>\", \"confidence\": 0.9}}\n\
           ]\n\
         }}"
    )
}

/// Shared output contract for the three critique checks.
const ISSUE_RECORD_CONTRACT: &str = "Report each finding on its own line as a \
delimiter-separated record:\n\
REF | SEVERITY | DESCRIPTION\n\
where REF is the reasoning step number, the offending claim text, or \"-\", \
and SEVERITY is one of: critical, high, medium, low.\n\
If there are no findings, respond with the single word: NONE";

/// Logical-consistency check over the reasoning trace.
pub fn logic_check(reasoning_block: &str, draft_content: &str) -> String {
    format!(
        "You are a rigorous academic critic. Examine the reasoning steps \
         below for contradictions, unjustified leaps, and missing logical \
         connections, and check that the answer actually follows from them. \
         Identify problems only; do not propose corrections.\n\n\
         Reasoning steps:\n{reasoning_block}\n\n\
         Answer:\n{draft_content}\n\n\
         {ISSUE_RECORD_CONTRACT}"
    )
}

/// Factual-grounding check of the draft against retrieved context.
pub fn fact_check(draft_content: &str, context: &str) -> String {
    format!(
        "You are a rigorous fact-checker. Compare the claims in the answer \
         against the course material. Flag any claim that the material \
         contradicts or does not support, quoting the offending claim as \
         the REF field. Identify problems only; do not propose corrections.\n\n\
         Answer:\n{draft_content}\n\n\
         Course material:\n{context}\n\n\
         {ISSUE_RECORD_CONTRACT}"
    )
}

/// Hallucination / irrelevance check.
pub fn hallucination_check(draft_content: &str, context: &str) -> String {
    format!(
        "You are a hallucination detector. Flag content in the answer that \
         is irrelevant to the material or appears fabricated: invented \
         facts, figures, formulas, citations, or terms that the course \
         material never mentions.\n\n\
         Answer:\n{draft_content}\n\n\
         Course material:\n{context}\n\n\
         {ISSUE_RECORD_CONTRACT}"
    )
}

/// Decision proposal. Parsed by `decision::parse_proposal`.
pub fn decision(
    critical: u32,
    high: u32,
    medium: u32,
    low: u32,
    round: u32,
    max_rounds: u32,
    issues_block: &str,
    has_prior_feedback: bool,
) -> String {
    let prior = if has_prior_feedback { "yes" } else { "no" };
    format!(
        "You are a debate moderator controlling a quality-assurance loop. \
         Based on the review findings, choose exactly one action:\n\
         - converged: the answer is acceptable (minor or no issues)\n\
         - iterate: the answer needs another revision pass\n\
         - abort_deadlock: further rounds will not converge\n\
         - escalate_with_warning: serious quality concerns must be surfaced\n\n\
         Round: {round} of {max_rounds}\n\
         Severity tally: {critical} critical, {high} high, {medium} medium, {low} low\n\
         Prior revision feedback given: {prior}\n\n\
         Findings:\n{issues_block}\n\n\
         Respond with exactly these labeled lines:\n\
         DECISION: <converged|iterate|abort_deadlock|escalate_with_warning>\n\
         REASONING: <one sentence>\n\
         FEEDBACK: <revision guidance if iterating, else ->\n\
         CONVERGENCE_SCORE: <0.00-1.00>"
    )
}

/// Final synthesis for a converged debate. Parsed by
/// `synthesis::parse_labeled_sections`.
pub fn synthesis_converged(
    query: &str,
    draft_content: &str,
    reasoning_block: &str,
    minor_issues: &str,
    convergence_score: f64,
) -> String {
    format!(
        "You are an educator synthesizing a verified answer into its final \
         form. Be clear, well structured, and pedagogically useful. Fold any \
         remaining minor issues into the text transparently instead of \
         hiding them. Write real content, never template placeholders.\n\n\
         Query: {query}\n\n\
         Verified draft:\n{draft_content}\n\n\
         Reasoning steps:\n{reasoning_block}\n\n\
         Remaining minor issues: {minor_issues}\n\
         Convergence score: {convergence_score:.2}\n\n\
         Respond with exactly these labeled sections:\n\
         INTRODUCTION: <brief problem overview>\n\
         STEP_BY_STEP_SOLUTION: <the detailed solution>\n\
         KEY_TAKEAWAYS: <concepts to remember>"
    )
}

/// Final synthesis for a deadlocked or escalated debate.
pub fn synthesis_partial(
    query: &str,
    draft_content: &str,
    unresolved_issues: &str,
    status: &str,
    reason: &str,
) -> String {
    format!(
        "You are presenting an answer that could not be fully verified. Be \
         transparent: present what held up, name what remains uncertain, and \
         suggest next steps. Use the actual draft and issues below; write \
         real content, never template placeholders.\n\n\
         Query: {query}\n\n\
         Best available draft:\n{draft_content}\n\n\
         Unresolved issues:\n{unresolved_issues}\n\n\
         Status: {status}\n\
         Reason: {reason}\n\n\
         Respond with exactly these labeled sections:\n\
         PARTIAL_SOLUTION: <the verified portion of the solution>\n\
         AREAS_OF_UNCERTAINTY: <what remains unresolved>\n\
         WHAT_WE_CAN_CONCLUDE: <what the material does support>\n\
         RECOMMENDATIONS: <how the reader can get a better answer>"
    )
}

/// Quality-indicator assessment of a final answer. Parsed by
/// `synthesis::parse_indicator_lines`.
pub fn quality_indicators(answer_text: &str, rounds: u32, convergence_score: f64) -> String {
    format!(
        "Assess the quality of this final answer.\n\n\
         Answer:\n{answer_text}\n\n\
         Debate rounds: {rounds}\n\
         Convergence score: {convergence_score:.2}\n\n\
         Respond with exactly these labeled lines, each scored 0-1:\n\
         COMPLETENESS: <0.00-1.00>\n\
         CLARITY: <0.00-1.00>\n\
         ACCURACY: <0.00-1.00>\n\
         PEDAGOGICAL_VALUE: <0.00-1.00>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_prompts_carry_record_contract() {
        for prompt in [
            logic_check("Step 1: base case", "answer"),
            fact_check("answer", "material"),
            hallucination_check("answer", "material"),
        ] {
            assert!(prompt.contains("REF | SEVERITY | DESCRIPTION"));
            assert!(prompt.contains("NONE"));
        }
    }

    #[test]
    fn test_decision_prompt_labels() {
        let prompt = decision(1, 0, 2, 0, 2, 3, "- findings -", true);
        assert!(prompt.contains("DECISION:"));
        assert!(prompt.contains("CONVERGENCE_SCORE:"));
        assert!(prompt.contains("Round: 2 of 3"));
        assert!(prompt.contains("1 critical"));
    }

    #[test]
    fn test_draft_prompt_includes_domain_instruction() {
        let prompt = draft("q", "ctx", Some("Answer in the style of ECE 350."));
        assert!(prompt.contains("ECE 350"));
        assert!(prompt.contains("draft_content"));
    }

    #[test]
    fn test_synthesis_section_labels() {
        let converged = synthesis_converged("q", "d", "steps", "None", 0.9);
        assert!(converged.contains("STEP_BY_STEP_SOLUTION:"));

        let partial = synthesis_partial("q", "d", "issues", "abort_deadlock", "max rounds");
        assert!(partial.contains("AREAS_OF_UNCERTAINTY:"));
        assert!(partial.contains("WHAT_WE_CAN_CONCLUDE:"));
    }
}
