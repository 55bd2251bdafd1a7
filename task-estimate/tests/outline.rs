use task_estimate::core::{Block, ListItem};
use task_estimate::estimate::extract;
use task_estimate::{NomMarkdownParser, format_document, parse_markdown_from_str, process_markdown, run};

fn process(input: &str) -> String {
    process_markdown(&NomMarkdownParser, input).expect("process")
}

#[test]
fn extraction_examples() {
    let a = extract("Design API 8h");
    assert_eq!((a.label.as_str(), a.hours), ("Design API", 8));
    let b = extract("Design API");
    assert_eq!((b.label.as_str(), b.hours), ("Design API", 0));
    assert_eq!(extract("8h").label, "");
}

#[test]
fn leaves_are_never_rewritten() {
    let input = "- Alone 5h\n- Nothing here\n- Zero 0h\n";
    assert_eq!(process(input), input);
}

#[test]
fn parent_gets_sum_of_children() {
    let output = process("- P 5h\n  - A 3h\n  - B 4h\n");
    assert_eq!(output.lines().next(), Some("- P 7h"));
    assert_eq!(output, "- P 7h\n  - A 3h\n  - B 4h\n");
}

#[test]
fn consistent_document_is_byte_identical() {
    let input = "* P   7h\n    * A 3h  \n    * B 4h\n";
    assert_eq!(process(input), input);
}

#[test]
fn totals_propagate_through_every_level() {
    let input = "\
- Release
  - Backend 1h
    - Schema 2h
    - API 3h
  - Frontend
    - Views 4h
";
    let expected = "\
- Release 9h
  - Backend 5h
    - Schema 2h
    - API 3h
  - Frontend 4h
    - Views 4h
";
    assert_eq!(process(input), expected);
}

#[test]
fn untimed_children_do_not_override_parent() {
    let input = "- P 5h\n  - A\n  - B\n";
    assert_eq!(process(input), input);
}

#[test]
fn empty_item_hides_its_subtree() {
    let input = "- P 1h\n  -\n    - Hidden 8h\n  - B 2h\n";
    assert_eq!(process(input), "- P 2h\n  -\n    - Hidden 8h\n  - B 2h\n");

    let mut doc = parse_markdown_from_str(input).expect("parse");
    let table = run(&mut doc);
    let labels: Vec<&str> = table.iter().map(|(_, a)| a.label.as_str()).collect();
    assert_eq!(labels, ["P", "B"]);
}

#[test]
fn running_twice_matches_running_once() {
    let input = "\
# Plan

1. Ship [docs](https://example.com)
   - Write 2h
   - Review `draft` 1h
2. **Polish** 9h
   - Fix bugs 3h
";
    let once = process(input);
    assert_eq!(process(&once), once);
    assert!(once.contains("1. Ship [docs](https://example.com) 3h\n"));
    assert!(once.contains("2. **Polish** 3h\n"));
}

#[test]
fn untouched_regions_survive_formatting() {
    let input = "\
Intro paragraph with <span>raw</span> html.

<div>
- not an outline 4h
</div>

- [ ] Task
  - [x] Sub 2h

> - Quoted
>   - Inner 1h
";
    let expected = "\
Intro paragraph with <span>raw</span> html.

<div>
- not an outline 4h
</div>

- [ ] Task 2h
  - [x] Sub 2h

> - Quoted 1h
>   - Inner 1h
";
    assert_eq!(process(input), expected);
}

#[test]
fn multi_line_item_keeps_its_first_lines() {
    let input = "- Long task\n  spanning lines 1h\n  - A 2h\n";
    assert_eq!(
        process(input),
        "- Long task\n  spanning lines 2h\n  - A 2h\n"
    );
}

#[test]
fn formatting_without_changes_reproduces_input() {
    let input = "- a\n\n- b\n  1) c\n  2) d 1h\n\n---\n";
    let doc = parse_markdown_from_str(input).expect("parse");
    assert_eq!(format_document(&doc), input);
}

#[test]
fn item_paragraph_is_first_paragraph() {
    let doc = parse_markdown_from_str("- Title 2h\n\n  Notes 5h\n").expect("parse");
    let Block::List(list) = &doc.blocks[0].block else {
        panic!("expected list");
    };
    let item: &ListItem = &list.items[0];
    assert_eq!(item.content.len(), 2);
    assert!(item.paragraph().is_some());
}

#[test]
fn indented_code_is_left_alone() {
    let input = "Example:\n\n    - P\n      - A 3h\n";
    assert_eq!(process(input), input);
}

#[test]
fn checkbox_without_text_is_an_ordinary_item() {
    let input = "- P 1h\n  - [ ]\n    - A 2h\n  - B 3h\n";
    assert_eq!(process(input), "- P 5h\n  - [ ] 2h\n    - A 2h\n  - B 3h\n");
}

#[test]
fn unbalanced_brackets_finish() {
    let input = format!("- Task {}](\n  - A 2h\n", "[".repeat(40));
    let expected = format!("- Task {}]( 2h\n  - A 2h\n", "[".repeat(40));
    assert_eq!(process(&input), expected);
}
