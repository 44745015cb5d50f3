//! Test entity types with hand-compiled accessor tables.

use std::cell::RefCell;
use std::rc::Rc;

use stratum::{
    CreatedEntity, DbValue, Engine, Entity, EntityDescriptor, FieldDef, FieldKind,
    HydrationSource, OrmState, QueryDef, Ref, Result, TrackedDyn,
};

pub fn as_text(value: &DbValue) -> String {
    match value {
        DbValue::Null => String::new(),
        DbValue::Text(text) => text.clone(),
        other => other.canonical(),
    }
}

pub fn as_u64(value: &DbValue) -> u64 {
    value.canonical().parse().unwrap_or(0)
}

pub fn as_bool(value: &DbValue) -> bool {
    value.canonical() == "1"
}

macro_rules! entity_boilerplate {
    ($type:ty) => {
        fn descriptor_of(&self) -> &'static EntityDescriptor {
            <$type as Entity>::descriptor()
        }

        fn id(&self) -> u64 {
            self.id
        }

        fn set_id(&mut self, id: u64) {
            self.id = id;
        }

        fn state(&self) -> &OrmState {
            &self.orm
        }

        fn state_mut(&mut self) -> &mut OrmState {
            &mut self.orm
        }
    };
}

/// Main cached-query test entity: local + redis caches, an indexed name,
/// an age column and a reference.
#[derive(Default, Debug)]
pub struct Person {
    pub orm: OrmState,
    pub id: u64,
    pub name: String,
    pub age: u16,
    pub ref_one: Ref<PersonRef>,
}

fn create_person() -> CreatedEntity {
    let handle = Rc::new(RefCell::new(Person::default()));
    CreatedEntity {
        dynamic: handle.clone(),
        any: handle,
    }
}

impl Entity for Person {
    fn descriptor() -> &'static EntityDescriptor {
        static FIELDS: &[FieldDef] = &[
            FieldDef {
                name: "Name",
                kind: FieldKind::String,
                tag: "length=100;index=NameIndex",
            },
            FieldDef {
                name: "Age",
                kind: FieldKind::Uint { bits: 16 },
                tag: "",
            },
            FieldDef {
                name: "RefOne",
                kind: FieldKind::Ref { entity: "PersonRef" },
                tag: "",
            },
        ];
        static QUERIES: &[QueryDef] = &[
            QueryDef {
                name: "IndexAge",
                one: false,
                template: ":Age = ? ORDER BY :ID",
                tag: "",
            },
            QueryDef {
                name: "IndexAll",
                one: false,
                template: "",
                tag: "",
            },
            QueryDef {
                name: "IndexName",
                one: true,
                template: ":Name = ?",
                tag: "",
            },
        ];
        static DESC: EntityDescriptor = EntityDescriptor {
            name: "Person",
            entity_tag: "localCache;redisCache",
            fields: FIELDS,
            queries: QUERIES,
            create: create_person,
        };
        &DESC
    }

    entity_boilerplate!(Person);

    fn get(&self, column: &str) -> DbValue {
        match column {
            "Name" => DbValue::Text(self.name.clone()),
            "Age" => DbValue::Uint(u64::from(self.age)),
            "RefOne" => self.ref_one.column_value(),
            _ => DbValue::Null,
        }
    }

    fn set(&mut self, column: &str, value: DbValue) -> Result<()> {
        match column {
            "Name" => self.name = as_text(&value),
            "Age" => self.age = as_u64(&value) as u16,
            "RefOne" => self.ref_one.apply_column_value(&value),
            _ => {}
        }
        Ok(())
    }

    fn pending_references(&self) -> Vec<TrackedDyn> {
        self.ref_one
            .unsaved_handle()
            .into_iter()
            .map(|handle| handle as TrackedDyn)
            .collect()
    }

    fn hydrate_references(&mut self, refs: &[String], source: &HydrationSource) {
        if refs.iter().any(|name| name == "RefOne") {
            if let Some(target) = source.fetch::<PersonRef>(self.ref_one.id()) {
                self.ref_one.set_loaded(target);
            }
        }
    }
}

#[derive(Default)]
pub struct PersonRef {
    pub orm: OrmState,
    pub id: u64,
    pub name: String,
}

fn create_person_ref() -> CreatedEntity {
    let handle = Rc::new(RefCell::new(PersonRef::default()));
    CreatedEntity {
        dynamic: handle.clone(),
        any: handle,
    }
}

impl Entity for PersonRef {
    fn descriptor() -> &'static EntityDescriptor {
        static FIELDS: &[FieldDef] = &[FieldDef {
            name: "Name",
            kind: FieldKind::String,
            tag: "",
        }];
        static DESC: EntityDescriptor = EntityDescriptor {
            name: "PersonRef",
            entity_tag: "localCache;redisCache",
            fields: FIELDS,
            queries: &[],
            create: create_person_ref,
        };
        &DESC
    }

    entity_boilerplate!(PersonRef);

    fn get(&self, column: &str) -> DbValue {
        match column {
            "Name" => DbValue::Text(self.name.clone()),
            _ => DbValue::Null,
        }
    }

    fn set(&mut self, column: &str, value: DbValue) -> Result<()> {
        if column == "Name" {
            self.name = as_text(&value);
        }
        Ok(())
    }
}

/// Fake-delete entity: deletions flip the flag and stay loadable by ID.
#[derive(Default)]
pub struct Note {
    pub orm: OrmState,
    pub id: u64,
    pub name: String,
    pub fake_delete: bool,
}

fn create_note() -> CreatedEntity {
    let handle = Rc::new(RefCell::new(Note::default()));
    CreatedEntity {
        dynamic: handle.clone(),
        any: handle,
    }
}

impl Entity for Note {
    fn descriptor() -> &'static EntityDescriptor {
        static FIELDS: &[FieldDef] = &[
            FieldDef {
                name: "Name",
                kind: FieldKind::String,
                tag: "",
            },
            FieldDef {
                name: "FakeDelete",
                kind: FieldKind::Bool,
                tag: "",
            },
        ];
        static QUERIES: &[QueryDef] = &[
            QueryDef {
                name: "IndexAll",
                one: false,
                template: "",
                tag: "",
            },
            QueryDef {
                name: "IndexName",
                one: false,
                template: ":Name = ?",
                tag: "",
            },
        ];
        static DESC: EntityDescriptor = EntityDescriptor {
            name: "Note",
            entity_tag: "localCache;redisCache",
            fields: FIELDS,
            queries: QUERIES,
            create: create_note,
        };
        &DESC
    }

    entity_boilerplate!(Note);

    fn get(&self, column: &str) -> DbValue {
        match column {
            "Name" => DbValue::Text(self.name.clone()),
            "FakeDelete" => DbValue::Bool(self.fake_delete),
            _ => DbValue::Null,
        }
    }

    fn set(&mut self, column: &str, value: DbValue) -> Result<()> {
        match column {
            "Name" => self.name = as_text(&value),
            "FakeDelete" => self.fake_delete = as_bool(&value),
            _ => {}
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct DeleteParent {
    pub orm: OrmState,
    pub id: u64,
    pub name: String,
}

fn create_delete_parent() -> CreatedEntity {
    let handle = Rc::new(RefCell::new(DeleteParent::default()));
    CreatedEntity {
        dynamic: handle.clone(),
        any: handle,
    }
}

impl Entity for DeleteParent {
    fn descriptor() -> &'static EntityDescriptor {
        static FIELDS: &[FieldDef] = &[FieldDef {
            name: "Name",
            kind: FieldKind::String,
            tag: "",
        }];
        static DESC: EntityDescriptor = EntityDescriptor {
            name: "DeleteParent",
            entity_tag: "localCache",
            fields: FIELDS,
            queries: &[],
            create: create_delete_parent,
        };
        &DESC
    }

    entity_boilerplate!(DeleteParent);

    fn get(&self, column: &str) -> DbValue {
        match column {
            "Name" => DbValue::Text(self.name.clone()),
            _ => DbValue::Null,
        }
    }

    fn set(&mut self, column: &str, value: DbValue) -> Result<()> {
        if column == "Name" {
            self.name = as_text(&value);
        }
        Ok(())
    }
}

/// Restrict-policy child: deleting its parent must fail.
#[derive(Default)]
pub struct ChildRestrict {
    pub orm: OrmState,
    pub id: u64,
    pub reference_one: Ref<DeleteParent>,
}

fn create_child_restrict() -> CreatedEntity {
    let handle = Rc::new(RefCell::new(ChildRestrict::default()));
    CreatedEntity {
        dynamic: handle.clone(),
        any: handle,
    }
}

impl Entity for ChildRestrict {
    fn descriptor() -> &'static EntityDescriptor {
        static FIELDS: &[FieldDef] = &[FieldDef {
            name: "ReferenceOne",
            kind: FieldKind::Ref {
                entity: "DeleteParent",
            },
            tag: "",
        }];
        static DESC: EntityDescriptor = EntityDescriptor {
            name: "ChildRestrict",
            entity_tag: "localCache",
            fields: FIELDS,
            queries: &[],
            create: create_child_restrict,
        };
        &DESC
    }

    entity_boilerplate!(ChildRestrict);

    fn get(&self, column: &str) -> DbValue {
        match column {
            "ReferenceOne" => self.reference_one.column_value(),
            _ => DbValue::Null,
        }
    }

    fn set(&mut self, column: &str, value: DbValue) -> Result<()> {
        if column == "ReferenceOne" {
            self.reference_one.apply_column_value(&value);
        }
        Ok(())
    }

    fn pending_references(&self) -> Vec<TrackedDyn> {
        self.reference_one
            .unsaved_handle()
            .into_iter()
            .map(|handle| handle as TrackedDyn)
            .collect()
    }

    fn hydrate_references(&mut self, refs: &[String], source: &HydrationSource) {
        if refs.iter().any(|name| name == "ReferenceOne") {
            if let Some(target) = source.fetch::<DeleteParent>(self.reference_one.id()) {
                self.reference_one.set_loaded(target);
            }
        }
    }
}

/// Cascade-policy child: deleting its parent removes it too.
#[derive(Default)]
pub struct ChildCascade {
    pub orm: OrmState,
    pub id: u64,
    pub reference_one: Ref<DeleteParent>,
}

fn create_child_cascade() -> CreatedEntity {
    let handle = Rc::new(RefCell::new(ChildCascade::default()));
    CreatedEntity {
        dynamic: handle.clone(),
        any: handle,
    }
}

impl Entity for ChildCascade {
    fn descriptor() -> &'static EntityDescriptor {
        static FIELDS: &[FieldDef] = &[FieldDef {
            name: "ReferenceOne",
            kind: FieldKind::Ref {
                entity: "DeleteParent",
            },
            tag: "cascade",
        }];
        static QUERIES: &[QueryDef] = &[QueryDef {
            name: "IndexParent",
            one: false,
            template: ":ReferenceOne = ?",
            tag: "",
        }];
        static DESC: EntityDescriptor = EntityDescriptor {
            name: "ChildCascade",
            entity_tag: "localCache",
            fields: FIELDS,
            queries: QUERIES,
            create: create_child_cascade,
        };
        &DESC
    }

    entity_boilerplate!(ChildCascade);

    fn get(&self, column: &str) -> DbValue {
        match column {
            "ReferenceOne" => self.reference_one.column_value(),
            _ => DbValue::Null,
        }
    }

    fn set(&mut self, column: &str, value: DbValue) -> Result<()> {
        if column == "ReferenceOne" {
            self.reference_one.apply_column_value(&value);
        }
        Ok(())
    }

    fn pending_references(&self) -> Vec<TrackedDyn> {
        self.reference_one
            .unsaved_handle()
            .into_iter()
            .map(|handle| handle as TrackedDyn)
            .collect()
    }
}

/// Entity-level dirty subscription: any change notifies the queue.
#[derive(Default)]
pub struct DirtyAll {
    pub orm: OrmState,
    pub id: u64,
    pub name: String,
}

fn create_dirty_all() -> CreatedEntity {
    let handle = Rc::new(RefCell::new(DirtyAll::default()));
    CreatedEntity {
        dynamic: handle.clone(),
        any: handle,
    }
}

impl Entity for DirtyAll {
    fn descriptor() -> &'static EntityDescriptor {
        static FIELDS: &[FieldDef] = &[FieldDef {
            name: "Name",
            kind: FieldKind::String,
            tag: "length=100",
        }];
        static DESC: EntityDescriptor = EntityDescriptor {
            name: "DirtyAll",
            entity_tag: "dirty=test",
            fields: FIELDS,
            queries: &[],
            create: create_dirty_all,
        };
        &DESC
    }

    entity_boilerplate!(DirtyAll);

    fn get(&self, column: &str) -> DbValue {
        match column {
            "Name" => DbValue::Text(self.name.clone()),
            _ => DbValue::Null,
        }
    }

    fn set(&mut self, column: &str, value: DbValue) -> Result<()> {
        if column == "Name" {
            self.name = as_text(&value);
        }
        Ok(())
    }
}

/// Field-level dirty subscriptions: only tagged columns notify.
#[derive(Default)]
pub struct DirtyFields {
    pub orm: OrmState,
    pub id: u64,
    pub name: String,
    pub age: u16,
    pub note: String,
}

fn create_dirty_fields() -> CreatedEntity {
    let handle = Rc::new(RefCell::new(DirtyFields::default()));
    CreatedEntity {
        dynamic: handle.clone(),
        any: handle,
    }
}

impl Entity for DirtyFields {
    fn descriptor() -> &'static EntityDescriptor {
        static FIELDS: &[FieldDef] = &[
            FieldDef {
                name: "Name",
                kind: FieldKind::String,
                tag: "dirty=test",
            },
            FieldDef {
                name: "Age",
                kind: FieldKind::Uint { bits: 16 },
                tag: "dirty=test",
            },
            FieldDef {
                name: "Note",
                kind: FieldKind::String,
                tag: "",
            },
        ];
        static DESC: EntityDescriptor = EntityDescriptor {
            name: "DirtyFields",
            entity_tag: "",
            fields: FIELDS,
            queries: &[],
            create: create_dirty_fields,
        };
        &DESC
    }

    entity_boilerplate!(DirtyFields);

    fn get(&self, column: &str) -> DbValue {
        match column {
            "Name" => DbValue::Text(self.name.clone()),
            "Age" => DbValue::Uint(u64::from(self.age)),
            "Note" => DbValue::Text(self.note.clone()),
            _ => DbValue::Null,
        }
    }

    fn set(&mut self, column: &str, value: DbValue) -> Result<()> {
        match column {
            "Name" => self.name = as_text(&value),
            "Age" => self.age = as_u64(&value) as u16,
            "Note" => self.note = as_text(&value),
            _ => {}
        }
        Ok(())
    }
}

/// Log-subscribed entity: every flush produces an audit record.
#[derive(Default)]
pub struct Audited {
    pub orm: OrmState,
    pub id: u64,
    pub name: String,
}

fn create_audited() -> CreatedEntity {
    let handle = Rc::new(RefCell::new(Audited::default()));
    CreatedEntity {
        dynamic: handle.clone(),
        any: handle,
    }
}

impl Entity for Audited {
    fn descriptor() -> &'static EntityDescriptor {
        static FIELDS: &[FieldDef] = &[FieldDef {
            name: "Name",
            kind: FieldKind::String,
            tag: "",
        }];
        static DESC: EntityDescriptor = EntityDescriptor {
            name: "Audited",
            entity_tag: "log",
            fields: FIELDS,
            queries: &[],
            create: create_audited,
        };
        &DESC
    }

    entity_boilerplate!(Audited);

    fn get(&self, column: &str) -> DbValue {
        match column {
            "Name" => DbValue::Text(self.name.clone()),
            _ => DbValue::Null,
        }
    }

    fn set(&mut self, column: &str, value: DbValue) -> Result<()> {
        if column == "Name" {
            self.name = as_text(&value);
        }
        Ok(())
    }
}

/// Lifecycle-hook entity: defaults on track, derived field after save,
/// validation before writes.
#[derive(Default)]
pub struct Hooked {
    pub orm: OrmState,
    pub id: u64,
    pub uint: u64,
    pub name: String,
    pub ref_one: Ref<PersonRef>,
    pub calculated: u64,
}

fn create_hooked() -> CreatedEntity {
    let handle = Rc::new(RefCell::new(Hooked::default()));
    CreatedEntity {
        dynamic: handle.clone(),
        any: handle,
    }
}

impl Entity for Hooked {
    fn descriptor() -> &'static EntityDescriptor {
        static FIELDS: &[FieldDef] = &[
            FieldDef {
                name: "Uint",
                kind: FieldKind::Uint { bits: 64 },
                tag: "",
            },
            FieldDef {
                name: "Name",
                kind: FieldKind::String,
                tag: "",
            },
            FieldDef {
                name: "RefOne",
                kind: FieldKind::Ref { entity: "PersonRef" },
                tag: "",
            },
            FieldDef {
                name: "Calculated",
                kind: FieldKind::Uint { bits: 64 },
                tag: "ignore",
            },
        ];
        static DESC: EntityDescriptor = EntityDescriptor {
            name: "Hooked",
            entity_tag: "",
            fields: FIELDS,
            queries: &[],
            create: create_hooked,
        };
        &DESC
    }

    entity_boilerplate!(Hooked);

    fn get(&self, column: &str) -> DbValue {
        match column {
            "Uint" => DbValue::Uint(self.uint),
            "Name" => DbValue::Text(self.name.clone()),
            "RefOne" => self.ref_one.column_value(),
            _ => DbValue::Null,
        }
    }

    fn set(&mut self, column: &str, value: DbValue) -> Result<()> {
        match column {
            "Uint" => self.uint = as_u64(&value),
            "Name" => self.name = as_text(&value),
            "RefOne" => self.ref_one.apply_column_value(&value),
            _ => {}
        }
        Ok(())
    }

    fn pending_references(&self) -> Vec<TrackedDyn> {
        self.ref_one
            .unsaved_handle()
            .into_iter()
            .map(|handle| handle as TrackedDyn)
            .collect()
    }

    fn set_defaults(&mut self) {
        self.uint = 3;
        self.name = "hello".to_string();
        self.ref_one = Ref::by_id(1);
    }

    fn validate(&self) -> Result<()> {
        if self.name == "invalid" {
            return Err(stratum::OrmError::Validation(
                "name must not be 'invalid'".to_string(),
            ));
        }
        Ok(())
    }

    fn after_saved(&mut self, _engine: &mut Engine) {
        self.calculated = self.uint + self.ref_one.id();
    }
}

/// Self-referencing entity for insert-cycle tests.
#[derive(Default)]
pub struct Chain {
    pub orm: OrmState,
    pub id: u64,
    pub name: String,
    pub next: Ref<Chain>,
}

fn create_chain() -> CreatedEntity {
    let handle = Rc::new(RefCell::new(Chain::default()));
    CreatedEntity {
        dynamic: handle.clone(),
        any: handle,
    }
}

impl Entity for Chain {
    fn descriptor() -> &'static EntityDescriptor {
        static FIELDS: &[FieldDef] = &[
            FieldDef {
                name: "Name",
                kind: FieldKind::String,
                tag: "",
            },
            FieldDef {
                name: "Next",
                kind: FieldKind::Ref { entity: "Chain" },
                tag: "",
            },
        ];
        static DESC: EntityDescriptor = EntityDescriptor {
            name: "Chain",
            entity_tag: "",
            fields: FIELDS,
            queries: &[],
            create: create_chain,
        };
        &DESC
    }

    entity_boilerplate!(Chain);

    fn get(&self, column: &str) -> DbValue {
        match column {
            "Name" => DbValue::Text(self.name.clone()),
            "Next" => self.next.column_value(),
            _ => DbValue::Null,
        }
    }

    fn set(&mut self, column: &str, value: DbValue) -> Result<()> {
        match column {
            "Name" => self.name = as_text(&value),
            "Next" => self.next.apply_column_value(&value),
            _ => {}
        }
        Ok(())
    }

    fn pending_references(&self) -> Vec<TrackedDyn> {
        self.next
            .unsaved_handle()
            .into_iter()
            .map(|handle| handle as TrackedDyn)
            .collect()
    }

    fn hydrate_references(&mut self, refs: &[String], source: &HydrationSource) {
        if refs.iter().any(|name| name == "Next") {
            if let Some(target) = source.fetch::<Chain>(self.next.id()) {
                self.next.set_loaded(target);
            }
        }
    }
}

/// Unique-name entity used by lazy flush and duplicate-key tests.
#[derive(Default)]
pub struct Account {
    pub orm: OrmState,
    pub id: u64,
    pub name: String,
    pub age: u64,
    pub ref_one: Ref<PersonRef>,
}

fn create_account() -> CreatedEntity {
    let handle = Rc::new(RefCell::new(Account::default()));
    CreatedEntity {
        dynamic: handle.clone(),
        any: handle,
    }
}

impl Entity for Account {
    fn descriptor() -> &'static EntityDescriptor {
        static FIELDS: &[FieldDef] = &[
            FieldDef {
                name: "Name",
                kind: FieldKind::String,
                tag: "unique=name",
            },
            FieldDef {
                name: "Age",
                kind: FieldKind::Uint { bits: 64 },
                tag: "",
            },
            FieldDef {
                name: "RefOne",
                kind: FieldKind::Ref { entity: "PersonRef" },
                tag: "",
            },
        ];
        static DESC: EntityDescriptor = EntityDescriptor {
            name: "Account",
            entity_tag: "localCache;redisCache",
            fields: FIELDS,
            queries: &[],
            create: create_account,
        };
        &DESC
    }

    entity_boilerplate!(Account);

    fn get(&self, column: &str) -> DbValue {
        match column {
            "Name" => DbValue::Text(self.name.clone()),
            "Age" => DbValue::Uint(self.age),
            "RefOne" => self.ref_one.column_value(),
            _ => DbValue::Null,
        }
    }

    fn set(&mut self, column: &str, value: DbValue) -> Result<()> {
        match column {
            "Name" => self.name = as_text(&value),
            "Age" => self.age = as_u64(&value),
            "RefOne" => self.ref_one.apply_column_value(&value),
            _ => {}
        }
        Ok(())
    }

    fn pending_references(&self) -> Vec<TrackedDyn> {
        self.ref_one
            .unsaved_handle()
            .into_iter()
            .map(|handle| handle as TrackedDyn)
            .collect()
    }
}
