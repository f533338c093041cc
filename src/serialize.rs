use crate::augmenter::ScanReport;

/// Serialize a ScanReport into compact text.
///
/// Example output:
/// ```text
/// page: [https://chat.example.com/app/1f3a]
/// selector: .user-query
/// ---
/// timeline (3):
///   u-5c1b0e2 "How do lifetimes wor"
///   turn-8842 "And what about Pin?"
///   u-0 "Query 3"
/// panels (1):
///   #chat-lens-thoughts-1
/// autosave: attached
/// ```
pub fn to_compact_text(report: &ScanReport) -> String {
    let mut output = String::new();

    if let Some(url) = &report.url {
        output.push_str(&format!("page: [{url}]\n"));
    }
    match &report.selector {
        Some(selector) => output.push_str(&format!("selector: {selector}\n")),
        None => output.push_str("selector: (none matched)\n"),
    }
    output.push_str("---\n");

    output.push_str(&format!("timeline ({}):\n", report.items.len()));
    for item in &report.items {
        output.push_str(&format!("  {} \"{}\"\n", item.id, escape(&item.text)));
    }

    if !report.panels.is_empty() {
        output.push_str(&format!("panels ({}):\n", report.panels.len()));
        for panel in &report.panels {
            output.push_str(&format!("  #{}\n", panel.root_id));
        }
    }

    output.push_str(if report.autosave {
        "autosave: attached\n"
    } else {
        "autosave: no editor\n"
    });

    output
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::MessageItem;
    use crate::panel::PanelLocator;

    #[test]
    fn full_report() {
        let report = ScanReport {
            url: Some("https://chat.example.com/app".into()),
            selector: Some(".user-query".into()),
            items: vec![
                MessageItem {
                    id: "u-921".into(),
                    text: "Hi".into(),
                },
                MessageItem {
                    id: "turn-8842".into(),
                    text: "say \"cheese\"".into(),
                },
            ],
            panels: vec![PanelLocator {
                root_id: "chat-lens-thoughts-1".into(),
            }],
            autosave: true,
            updates: 1,
        };
        assert_eq!(
            to_compact_text(&report),
            "page: [https://chat.example.com/app]\n\
             selector: .user-query\n\
             ---\n\
             timeline (2):\n\
             \x20 u-921 \"Hi\"\n\
             \x20 turn-8842 \"say \\\"cheese\\\"\"\n\
             panels (1):\n\
             \x20 #chat-lens-thoughts-1\n\
             autosave: attached\n"
        );
    }

    #[test]
    fn empty_report() {
        let text = to_compact_text(&ScanReport::default());
        assert_eq!(
            text,
            "selector: (none matched)\n---\ntimeline (0):\nautosave: no editor\n"
        );
    }
}
