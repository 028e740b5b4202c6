use spark_compose::{
    cloned, computation, create_cell, derived, destroy_computation, flush, node_fragment, Fragment,
};

#[test]
fn macro_derived_syntax() {
    let a = create_cell(10);
    let b = create_cell(20);

    let sum = derived!(a, b => a.read() + b.read());
    assert_eq!(sum.read(), 30);

    a.write(15);
    assert_eq!(sum.read(), 35);
}

#[test]
fn macro_lists_take_a_trailing_comma() {
    let width = create_cell(2);
    let height = create_cell(3);

    let area = derived!(width, height, => width.read() * height.read());
    assert_eq!(area.read(), 6);

    let perimeter = derived(cloned!(width, height, => move || 2 * (width.read() + height.read())));
    height.write(4);
    assert_eq!(perimeter.read(), 12);
}

#[test]
fn macro_nested_usage() {
    let a = create_cell(1);

    let d = derived!(a => {
        let inner = derived!(a => a.read() * 2);
        inner.read()
    });

    assert_eq!(d.read(), 2);
}

#[test]
fn macro_computation_syntax() {
    let name = create_cell("world");
    let count = create_cell(1);

    let node = computation!(name, count => |_c| {
        Fragment::text(format!("hello {} x{}", name.read(), count.read()))
    })
    .unwrap();
    flush().unwrap();
    assert_eq!(node_fragment(node).unwrap().text_value(), Some("hello world x1"));

    count.write(2);
    flush().unwrap();
    assert_eq!(node_fragment(node).unwrap().text_value(), Some("hello world x2"));

    // Handles used afterwards were cloned, not moved
    name.write("rust");
    flush().unwrap();
    assert_eq!(node_fragment(node).unwrap().text_value(), Some("hello rust x2"));

    destroy_computation(node).unwrap();
    flush().unwrap();
}

#[test]
fn macro_computation_with_children() {
    let rows = create_cell(vec!["a", "b"]);

    let node = computation!(rows => |c| {
        Fragment::new("list").children_from(
            rows.read()
                .into_iter()
                .map(|row| c.child(row, move |_| Fragment::text(row))),
        )
    })
    .unwrap();
    flush().unwrap();

    let list = node_fragment(node).unwrap();
    assert_eq!(list.children().len(), 2);
    assert!(list.children().iter().all(Fragment::is_slot));

    let plain = computation!(|_c| Fragment::new("static")).unwrap();
    let shown = derived(cloned!(rows => move || rows.read().len()));
    assert_eq!(shown.read(), 2);

    destroy_computation(node).unwrap();
    destroy_computation(plain).unwrap();
    flush().unwrap();
}
