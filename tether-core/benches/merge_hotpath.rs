use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::collections::HashSet;
use std::hint::black_box;
use tether_core::{Document, EntityKind, FieldDescriptor, FieldTable};

const FIELDS: &[FieldDescriptor] = &[
    FieldDescriptor::new("Name", "name"),
    FieldDescriptor::new("Description", "desc"),
    FieldDescriptor::new("Position", "pos"),
    FieldDescriptor::new("IsClosed", "closed"),
    FieldDescriptor::new("DueDate", "due"),
    FieldDescriptor::new("List", "idList"),
    FieldDescriptor::new("Board", "idBoard"),
];
const TABLE: FieldTable = FieldTable::new(EntityKind::Card, FIELDS);

fn incoming(i: u64) -> Document {
    Document::from_value(json!({
        "id": "5a1b2c3d4e5f6a7b8c9d0e1f",
        "name": format!("card {i}"),
        "desc": "a fairly ordinary description",
        "pos": i * 1024,
        "closed": false,
        "due": null,
        "idList": "0123456789abcdef01234567",
        "idBoard": "fedcba9876543210fedcba98",
    }))
    .expect("object document")
}

fn bench_merge(c: &mut Criterion) {
    let pending: HashSet<&str> = ["name", "pos"].into_iter().collect();
    let doc = incoming(1);

    c.bench_function("document/merge_skip_pending", |b| {
        b.iter(|| {
            let mut current = Document::new();
            let changed = current.merge_from(black_box(&doc), |key| pending.contains(key));
            let names: Vec<&str> = changed.iter().map(|k| TABLE.name_for(k)).collect();
            black_box(names.len());
        });
    });

    c.bench_function("descriptor/fields_parameter", |b| {
        b.iter(|| black_box(TABLE.fields_parameter()));
    });
}

criterion_group!(benches, bench_merge);
criterion_main!(benches);
