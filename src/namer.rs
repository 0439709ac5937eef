//! Collection naming policy.
//!
//! Every vector store call goes through [`collection_name`], so backends never
//! need to know how projects map to collections.

/// Name of the collection holding `project_id`'s embeddings of size `dim`.
pub fn collection_name(dim: usize, project_id: i64) -> String {
    format!("collection_{}_{}", dim, project_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_is_deterministic() {
        assert_eq!(collection_name(1536, 7), collection_name(1536, 7));
        assert_eq!(collection_name(1536, 7), "collection_1536_7");
    }

    #[test]
    fn test_dimension_and_project_both_matter() {
        assert_ne!(collection_name(3, 1), collection_name(4, 1));
        assert_ne!(collection_name(3, 1), collection_name(3, 2));
    }
}
