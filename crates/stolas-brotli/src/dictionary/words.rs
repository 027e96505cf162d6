//! The embedded word bank.
//!
//! Words are grouped by length (4..=24); each group's size is a power of
//! two so a word reference packs into `size_bits` index bits plus a
//! transform id. The bank leans on common English and web-text tokens,
//! ordered roughly by frequency within each group.

pub const WORDS_BY_LENGTH: [&[&str]; 25] = [
    &[],
    &[],
    &[],
    &[],
    // length 4, 32 words
    &[
        "have", "that", "with", "this", "they", "from", "your", "will", "time", "were", "been",
        "more", "when", "what", "some", "than", "only", "over", "such", "into", "most", "make",
        "like", "then", "well", "also", "each", "very", "just", "must", "here", "many",
    ],
    // length 5, 32 words
    &[
        "which", "there", "their", "would", "about", "other", "could", "first", "after", "these",
        "where", "being", "every", "great", "might", "shall", "still", "those", "under", "while",
        "world", "years", "since", "never", "small", "found", "place", "right", "think", "three",
        "water", "house",
    ],
    // length 6, 32 words
    &[
        "should", "before", "little", "people", "around", "number", "always", "really", "mother",
        "father", "public", "school", "system", "during", "second", "enough", "change", "social",
        "family", "market", "result", "though", "within", "called", "making", "nature", "course",
        "action", "period", "moment", "design", "health",
    ],
    // length 7, 32 words
    &[
        "because", "between", "through", "another", "against", "without", "nothing", "general",
        "however", "country", "example", "company", "program", "problem", "service", "thought",
        "present", "himself", "history", "special", "believe", "already", "certain", "members",
        "million", "support", "perhaps", "control", "society", "several", "changes", "website",
    ],
    // length 8, 16 words
    &[
        "business", "children", "question", "together", "interest", "possible", "national",
        "research", "although", "anything", "services", "problems", "economic", "position",
        "standard", "language",
    ],
    // length 9, 16 words
    &[
        "important", "different", "following", "education", "community", "available", "political",
        "including", "sometimes", "knowledge", "questions", "developed", "described", "structure",
        "establish", "published",
    ],
    // length 10, 16 words
    &[
        "government", "understand", "everything", "themselves", "individual", "particular",
        "technology", "management", "production", "experience", "university", "interested",
        "considered", "connection", "background", "characters",
    ],
    // length 11, 8 words
    &[
        "information", "development", "environment", "performance", "application", "significant",
        "educational", "interesting",
    ],
    // length 12, 8 words
    &[
        "organization", "particularly", "construction", "professional", "relationship",
        "introduction", "successfully", "conservation",
    ],
    // length 13, 8 words
    &[
        "international", "understanding", "relationships", "environmental", "communication",
        "consideration", "establishment", "demonstration",
    ],
    // length 14, 4 words
    &[
        "administration",
        "implementation",
        "representative",
        "characteristic",
    ],
    // length 15, 4 words
    &[
        "recommendations",
        "representatives",
        "characteristics",
        "internationally",
    ],
    // length 16, 4 words
    &[
        "responsibilities",
        "at the same time",
        "as a consequence",
        "for the purposes",
    ],
    // length 17, 4 words
    &[
        "telecommunication",
        "on the other hand",
        "in order to avoid",
        "more information ",
    ],
    // length 18, 4 words
    &[
        "telecommunications",
        "general discussion",
        "should be noted as",
        "in the first place",
    ],
    // length 19, 2 words
    &["further information", "the fact that there"],
    // length 20, 2 words
    &["for more information", "as soon as possible "],
    // length 21, 2 words
    &["environmental impact ", "further consideration"],
    // length 22, 2 words
    &["implementation details", "throughout the country"],
    // length 23, 2 words
    &["significant differences", "characteristics of the "],
    // length 24, 2 words
    &["environmental protection", "recommendations from the"],
];
