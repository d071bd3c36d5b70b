use sea_orm::sea_query;
use sea_orm_migration::prelude::Iden;

#[derive(Iden, Clone, Copy)]
pub enum Uidentities {
    Table,
    Uuid,
}

#[derive(Iden, Clone, Copy)]
pub enum Profiles {
    Table,
    Uuid,
    Name,
    Email,
    IsBot,
}

/// Per-source aliases of an identity.
#[derive(Iden, Clone, Copy)]
pub enum Identities {
    Table,
    Id,
    Uuid,
    Name,
    Email,
    Username,
    Source,
}

#[derive(Iden, Clone, Copy)]
pub enum Organizations {
    Table,
    Id,
    Name,
}

#[derive(Iden, Clone, Copy)]
pub enum Enrollments {
    Table,
    Id,
    Uuid,
    OrganizationId,
    Start,
    End,
    ProjectSlug,
}
