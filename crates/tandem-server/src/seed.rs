//! Documents a fresh server starts with.

use tandem_transform::Doc;

/// Text of an instance created on first access.
pub const DEFAULT_TEXT: &str =
    "This is a collaborative test document. Start editing to make it more interesting!";

pub fn default_doc() -> Doc {
    Doc::new(DEFAULT_TEXT)
}

/// The named documents a server without saved state is populated with.
pub fn default_instances() -> Vec<(&'static str, Doc)> {
    vec![
        (
            "Example",
            Doc::new("Example Document\nThere is nothing here yet. Add something!"),
        ),
        (
            "Business Plan",
            Doc::new("Business Plan\n1. Give away software\n2. ???\n3. Profit!!!"),
        ),
        (
            "*scratch*",
            Doc::new(
                ";; This buffer is for notes you don't want to save, and for Lisp evaluation.\n\
                 ;; If you want to create a file, visit that file with C-x C-f,\n\
                 ;; then enter the text in that file's own buffer.",
            ),
        ),
        (
            "Nonsense",
            Doc::new(
                "Mona tried to tell me\n\
                 To stay away from the train line.\n\
                 She said that all the railroad men\n\
                 Just drink up your blood like wine.\n\
                 An' I said, \u{201c}Oh, I didn't know that,\n\
                 But then again, there's only one I've met\n\
                 An' he just smoked my eyelids\n\
                 An' punched my cigarette.\u{201d}\n\
                 Oh, Mama, can this really be the end,\n\
                 To be stuck inside of Mobile\n\
                 With the Memphis blues again.\n\
                 \u{2014} Bob Dylan, Stuck Inside of Mobile with the Memphis Blues Again",
            ),
        ),
        (
            "Comment Section",
            Doc::new(
                "Comment Section\n\
                 The good thing about this comment section is that everybody can delete comments.",
            ),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_names_are_unique() {
        let instances = default_instances();
        let mut names: Vec<_> = instances.iter().map(|(name, _)| *name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), instances.len());
        assert!(names.contains(&"*scratch*"));
    }
}
